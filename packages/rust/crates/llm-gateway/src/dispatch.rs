//! The end-to-end dispatch pipeline (§4.5): Context Builder → Dynamic Router →
//! Coalescer → Pacer → Provider → Stream Hub → SSE. This is the algorithm the HTTP
//! handlers in `gateway::http` drive; it is transport-agnostic so both the streaming
//! and non-streaming endpoints share it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;

use crate::coalescer::{Coalescer, CoalesceKey, LeaderOutput, Role};
use crate::config::RuntimeSettings;
use crate::context::ContextBuilder;
use crate::errors::{GatewayError, MAX_RETRIES, backoff_delay_ms};
use crate::hub::{HubEvent, StreamHub};
use crate::metrics::{CoalesceRole, MetricsRegistry, RequestRecord};
use crate::pacer::PacerRegistry;
use crate::provider::{ProviderAdapter, ProviderEvent, RequestOptions};
use crate::router::{DynamicRouter, ProviderCandidate};
use crate::thread_store::{Turn, ThreadStore};

/// Everything the dispatch pipeline needs, threaded through from the HTTP layer.
pub struct GatewayState {
    /// Thread store shared across all requests.
    pub thread_store: Arc<ThreadStore>,
    /// Context builder (memory + rewriter collaborators).
    pub context_builder: Arc<ContextBuilder>,
    /// Dynamic router.
    pub router: Arc<dyn DynamicRouter>,
    /// Candidate provider/model pool the router scores against.
    pub candidates: Vec<ProviderCandidate>,
    /// In-flight request deduplicator.
    pub coalescer: Arc<Coalescer>,
    /// Pub/sub fan-out hub.
    pub hub: Arc<StreamHub>,
    /// Per-provider pacers.
    pub pacers: Arc<PacerRegistry>,
    /// Provider adapters, keyed by provider name.
    pub providers: std::collections::HashMap<String, Arc<dyn ProviderAdapter>>,
    /// Rolling metrics window.
    pub metrics: Arc<MetricsRegistry>,
    /// Loaded environment configuration.
    pub settings: RuntimeSettings,
}

/// A fully validated, parsed request entering the dispatch pipeline (§6.1 request
/// body).
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Target thread.
    pub thread_id: String,
    /// User-supplied content.
    pub content: String,
    /// Explicit provider override, bypassing the router when present.
    pub provider: Option<String>,
    /// Explicit model override, bypassing the router when present.
    pub model: Option<String>,
    /// Whether to consult the memory provider for this request.
    pub use_memory: bool,
    /// Whether to consult the query rewriter for this request.
    pub use_query_rewriter: bool,
}

/// §4.5 step 1: parse & validate. Zero-byte content is rejected (§8 boundary case).
pub fn validate(thread_id: &str, content: &str, org_id: Option<&str>) -> Result<(), GatewayError> {
    if org_id.map(str::trim).unwrap_or_default().is_empty() {
        return Err(GatewayError::Auth("missing x-org-id header".into()));
    }
    if thread_id.trim().is_empty() {
        return Err(GatewayError::Validation("thread_id must not be empty".into()));
    }
    if content.trim().is_empty() {
        return Err(GatewayError::Validation("content must not be empty".into()));
    }
    Ok(())
}

/// The non-hub outcome of a full dispatch, for the non-streaming endpoint (§6.1).
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Final assistant content.
    pub assistant_content: String,
    /// Provider the request was routed to.
    pub provider: String,
    /// Model the request was routed to.
    pub model: String,
    /// Time to first upstream byte, ms.
    pub ttft_ms: u64,
    /// Pacer queue-wait, ms.
    pub queue_wait_ms: u64,
    /// Leader retries performed.
    pub retries: u32,
    /// Every viable candidate's score from the route decision (§6.1).
    pub scores: Vec<crate::router::CandidateScore>,
}

/// Steps 3-5 of §4.5: build context, route, and derive the coalesce key. Factored out
/// so the streaming HTTP handler can subscribe to the hub under the *exact* key
/// `dispatch` will publish to, before `dispatch` itself runs — both sites call this
/// one function instead of each re-deriving the key and risking drift (§9). The
/// router is required to be a deterministic function of its inputs (§4.7), so calling
/// this twice for the same request (once to subscribe, once inside `dispatch`)
/// reliably yields the same decision and key.
pub async fn resolve_route(
    state: &GatewayState,
    request: &DispatchRequest,
) -> (crate::router::RouteDecision, CoalesceKey, Vec<crate::thread_store::MessageEnvelope>) {
    // Step 3: build context (read-only on the thread store, before any write).
    let context_messages = state
        .context_builder
        .build_with_overrides(
            &state.thread_store,
            &request.thread_id,
            &request.content,
            state.settings.thread.window_turns,
            request.use_memory,
            request.use_query_rewriter,
        )
        .await;

    // Step 4: route.
    let history = state.thread_store.get_history(&request.thread_id, state.settings.thread.window_turns);
    let decision = if let (Some(provider), Some(model)) = (&request.provider, &request.model) {
        Some(crate::router::RouteDecision {
            provider: provider.clone(),
            model: model.clone(),
            reason: "explicit override".into(),
            scores: vec![],
        })
    } else {
        state.router.route(&request.content, &history, &state.candidates).await
    };
    let decision = decision.unwrap_or_else(|| crate::router::RouteDecision {
        provider: state.settings.default_provider.clone(),
        model: state.settings.default_model.clone(),
        reason: "no viable candidate; using configured default".into(),
        scores: vec![],
    });

    // Step 5: compute coalesce key from (provider, model, normalized messages).
    let coalesce_key = if state.settings.coalesce.enabled {
        CoalesceKey::from_request(&decision.provider, &decision.model, &context_messages)
    } else {
        // Bypass: every request gets a unique key so none ever coalesce.
        CoalesceKey::new(uuid::Uuid::new_v4().to_string())
    };

    (decision, coalesce_key, context_messages)
}

/// Run the full dispatch pipeline for one request, publishing every intermediate
/// event to the hub as it goes (§4.5 steps 2-9). Callers that only need the final
/// result (the non-streaming endpoint) can await the returned future directly;
/// callers that need the stream (the SSE endpoint) should call [`resolve_route`] and
/// subscribe to the hub with the returned `coalesce_key` *before* calling this
/// function, per §4.5 step 6 / §9.
pub async fn dispatch(state: &GatewayState, request: DispatchRequest) -> Result<DispatchOutcome, GatewayError> {
    let started = Instant::now();

    let (decision, coalesce_key, context_messages) = resolve_route(state, &request).await;
    let provider_name = decision.provider.clone();
    let model_name = decision.model.clone();

    state.hub.publish(&coalesce_key, HubEvent::Router(decision.clone())).await;

    let thread_store = Arc::clone(&state.thread_store);
    let pacers = Arc::clone(&state.pacers);
    let hub = Arc::clone(&state.hub);
    let providers = state.providers.clone();
    let deadline_ms = state.settings.client_first_token_timeout_ms;
    let thread_id = request.thread_id.clone();
    let content = request.content.clone();
    let coalesce_key_for_leader = coalesce_key.clone();
    let assigned_role = Arc::new(std::sync::Mutex::new(Role::Leader));
    let role_for_callback = Arc::clone(&assigned_role);

    let outcome = state
        .coalescer
        .run(
            coalesce_key.clone(),
            move || {
                run_leader(
                    thread_store,
                    pacers,
                    hub,
                    providers,
                    provider_name,
                    model_name,
                    context_messages,
                    thread_id,
                    content,
                    coalesce_key_for_leader,
                    Duration::from_millis(deadline_ms),
                )
            },
            |role| {
                *role_for_callback.lock().unwrap() = role;
                tracing::debug!(
                    event = "dispatch.coalesce_role",
                    role = ?role,
                    "assigned coalesce role"
                );
            },
        )
        .await;

    let role = *assigned_role.lock().unwrap();
    let coalesce_role = match role {
        Role::Leader => CoalesceRole::Leader,
        Role::Follower => CoalesceRole::Follower,
    };

    let total_ms = started.elapsed().as_millis() as u64;
    match &outcome {
        Ok(leader_output) => {
            state.metrics.record(RequestRecord {
                ttft_ms: leader_output.ttft_ms,
                total_ms,
                queue_wait_ms: leader_output.queue_wait_ms,
                provider: decision.provider.clone(),
                model: decision.model.clone(),
                status: "ok",
                error_kind: None,
                coalesce_role,
                retries: leader_output.retries,
            });
        }
        Err(err) => {
            state.metrics.record(RequestRecord {
                ttft_ms: 0,
                total_ms,
                queue_wait_ms: 0,
                provider: decision.provider.clone(),
                model: decision.model.clone(),
                status: "error",
                error_kind: Some(err.kind()),
                coalesce_role,
                retries: 0,
            });
        }
    }

    outcome.map(|leader_output| DispatchOutcome {
        assistant_content: leader_output.final_content,
        provider: decision.provider,
        model: decision.model,
        ttft_ms: leader_output.ttft_ms,
        queue_wait_ms: leader_output.queue_wait_ms,
        retries: leader_output.retries,
        scores: decision.scores,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_leader(
    thread_store: Arc<ThreadStore>,
    pacers: Arc<PacerRegistry>,
    hub: Arc<StreamHub>,
    providers: std::collections::HashMap<String, Arc<dyn ProviderAdapter>>,
    provider_name: String,
    model_name: String,
    context_messages: Vec<crate::thread_store::MessageEnvelope>,
    thread_id: String,
    user_content: String,
    coalesce_key: CoalesceKey,
    overall_deadline: Duration,
) -> Result<LeaderOutput, GatewayError> {
    let leader_started = Instant::now();

    // Step 7a: append user turn (leader-only; see §9 for why followers never write).
    thread_store.append_turn(&thread_id, Turn::new("user", user_content));

    let Some(adapter) = providers.get(&provider_name).cloned() else {
        let err = GatewayError::UpstreamFatal(format!("no adapter registered for provider {provider_name}"));
        hub.publish(&coalesce_key, HubEvent::Error(err.to_error_body())).await;
        return Err(err);
    };

    let pacer = pacers.get(&provider_name);
    let mut retries = 0u32;
    let mut queue_wait_ms = 0u64;

    let outcome = loop {
        let permit_and_wait = if let Some(pacer) = &pacer {
            match pacer.acquire(overall_deadline).await {
                Ok((permit, wait)) => {
                    queue_wait_ms = wait.as_millis() as u64;
                    Some(permit)
                }
                Err(err) => break Err(err),
            }
        } else {
            None
        };

        let started = Instant::now();
        let stream_result = adapter
            .stream(&context_messages, &model_name, &RequestOptions::default())
            .await;

        if let Some(permit) = permit_and_wait {
            crate::pacer::release(permit);
        }

        match stream_result {
            Ok(mut stream) => {
                let mut ttft_ms = 0u64;
                let mut first_byte_seen = false;
                let mut final_content = String::new();
                let mut stream_error: Option<GatewayError> = None;

                while let Some(event) = stream.next().await {
                    match event {
                        ProviderEvent::Delta { content } => {
                            if !first_byte_seen {
                                first_byte_seen = true;
                                ttft_ms = started.elapsed().as_millis() as u64;
                                hub.publish(
                                    &coalesce_key,
                                    HubEvent::Meta {
                                        ttft_ms,
                                        queue_wait_ms,
                                        provider: provider_name.clone(),
                                        model: model_name.clone(),
                                    },
                                )
                                .await;
                            }
                            final_content.push_str(&content);
                            hub.publish(&coalesce_key, HubEvent::Delta { content }).await;
                        }
                        ProviderEvent::UsageMeta { .. } => {}
                        ProviderEvent::Error { body, .. } => {
                            stream_error = Some(GatewayError::UpstreamTransient(body));
                            break;
                        }
                        ProviderEvent::End => break,
                    }
                }

                if let Some(err) = stream_error {
                    break Err(err);
                }
                break Ok(LeaderOutput { final_content, ttft_ms, queue_wait_ms, retries });
            }
            Err(err) if err.retryable() && retries < MAX_RETRIES => {
                retries += 1;
                tokio::time::sleep(Duration::from_millis(backoff_delay_ms(retries))).await;
                continue;
            }
            Err(err) => break Err(err),
        }
    };

    match outcome {
        Ok(leader_output) => {
            thread_store.append_turn(&thread_id, Turn::new("assistant", leader_output.final_content.clone()));
            let final_hash = blake3::hash(leader_output.final_content.as_bytes()).to_hex().to_string();
            let total_ms = leader_started.elapsed().as_millis() as u64;
            hub.publish(&coalesce_key, HubEvent::Done { total_ms, final_hash }).await;
            hub.close(&coalesce_key).await;
            Ok(LeaderOutput { retries, ..leader_output })
        }
        Err(err) => {
            hub.publish(&coalesce_key, HubEvent::Error(err.to_error_body())).await;
            hub.close(&coalesce_key).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::hub::StreamHub;
    use crate::metrics::MetricsRegistry;
    use crate::pacer::PacerRegistry;
    use crate::router::HeuristicRouter;
    use crate::thread_store::ThreadStore;

    #[test]
    fn rejects_empty_content() {
        assert!(validate("t1", "", Some("org")).is_err());
    }

    #[test]
    fn rejects_missing_org_header() {
        assert!(validate("t1", "hi", None).is_err());
    }

    #[test]
    fn accepts_well_formed_request() {
        assert!(validate("t1", "hi", Some("org")).is_ok());
    }

    fn state_with_router_candidates() -> GatewayState {
        GatewayState {
            thread_store: Arc::new(ThreadStore::new()),
            context_builder: Arc::new(ContextBuilder::default()),
            router: Arc::new(HeuristicRouter::default()),
            candidates: vec![
                ProviderCandidate {
                    provider: "alpha".into(),
                    model: "m1".into(),
                    capability: 0.9,
                    speed: 0.5,
                    cheapness: 0.5,
                    max_context_tokens: 100_000,
                    positive_feedback: 0,
                    negative_feedback: 0,
                    attempts: 0,
                },
                ProviderCandidate {
                    provider: "beta".into(),
                    model: "m2".into(),
                    capability: 0.3,
                    speed: 0.9,
                    cheapness: 0.9,
                    max_context_tokens: 100_000,
                    positive_feedback: 0,
                    negative_feedback: 0,
                    attempts: 0,
                },
            ],
            coalescer: Arc::new(Coalescer::new()),
            hub: Arc::new(StreamHub::new()),
            pacers: Arc::new(PacerRegistry::new()),
            providers: std::collections::HashMap::new(),
            metrics: Arc::new(MetricsRegistry::new()),
            settings: RuntimeSettings::default(),
        }
    }

    #[tokio::test]
    async fn resolve_route_is_stable_across_repeated_calls_for_the_same_request() {
        // Regression: the streaming handler calls `resolve_route` to subscribe, then
        // `dispatch` calls it again internally when it actually runs. Both calls must
        // land on the same coalesce key or the subscriber never sees the leader's
        // events (§9).
        let state = state_with_router_candidates();
        let request = DispatchRequest {
            thread_id: "t1".into(),
            content: "hello there, routed request".into(),
            provider: None,
            model: None,
            use_memory: false,
            use_query_rewriter: false,
        };

        let (first_decision, first_key, _) = resolve_route(&state, &request).await;
        let (second_decision, second_key, _) = resolve_route(&state, &request).await;

        assert_eq!(first_decision.provider, second_decision.provider);
        assert_eq!(first_decision.model, second_decision.model);
        assert_eq!(format!("{first_key:?}"), format!("{second_key:?}"));
    }
}
