//! Dynamic Router interface (§4.7): classifies a query and scores provider/model
//! candidates. Out-of-band on the critical path — a heuristic implementation is
//! provided that meets the contract (equivalent requests produce equivalent
//! decisions) without requiring a classifier LLM call.

use async_trait::async_trait;
use serde::Serialize;

use crate::thread_store::Turn;

/// Coarse intent classification used to weight scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Writing or debugging code.
    Coding,
    /// Needs up-to-date web information.
    WebResearch,
    /// Multi-step reasoning.
    DeepReasoning,
    /// Condensing existing text.
    Summarization,
    /// Analyzing a supplied document.
    DocumentAnalysis,
    /// Open-ended writing.
    CreativeWriting,
    /// Numeric/symbolic computation.
    Math,
    /// Default conversational fallback.
    GenericChat,
}

impl Default for TaskType {
    fn default() -> Self {
        Self::GenericChat
    }
}

/// What the caller is optimizing for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Favor capability.
    Quality,
    /// Favor low latency.
    Speed,
    /// Favor cheapness.
    Cost,
}

/// Output of the (cheap, possibly LLM-backed) intent classifier.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Coarse task category.
    pub task_type: TaskType,
    /// What to optimize scoring for.
    pub priority: Priority,
    /// Whether the query needs live web access.
    pub requires_web: bool,
    /// Estimated input token count for the assembled context.
    pub estimated_input_tokens: usize,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            task_type: TaskType::GenericChat,
            priority: Priority::Quality,
            requires_web: false,
            estimated_input_tokens: 0,
        }
    }
}

/// A provider/model candidate with a declared capability envelope.
#[derive(Debug, Clone)]
pub struct ProviderCandidate {
    /// Provider identifier.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Capability score in `[0, 1]`.
    pub capability: f64,
    /// Speed score in `[0, 1]` (higher is faster).
    pub speed: f64,
    /// Cheapness score in `[0, 1]` (higher is cheaper).
    pub cheapness: f64,
    /// Maximum context window in tokens.
    pub max_context_tokens: usize,
    /// Cumulative positive feedback observations.
    pub positive_feedback: u64,
    /// Cumulative negative feedback observations.
    pub negative_feedback: u64,
    /// Total attempts recorded (used to derive `historical_reward`).
    pub attempts: u64,
}

impl ProviderCandidate {
    /// `(positive - negative) / attempts`, defaulting to 0.5 with no history (§4.7).
    #[must_use]
    pub fn historical_reward(&self) -> f64 {
        if self.attempts == 0 {
            return 0.5;
        }
        let delta = self.positive_feedback as f64 - self.negative_feedback as f64;
        (delta / self.attempts as f64).clamp(-1.0, 1.0)
    }
}

/// One candidate's breakdown, as surfaced in the `router` SSE event (§3, §6.2).
#[derive(Debug, Clone, Serialize)]
pub struct CandidateScore {
    /// Provider identifier.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Weighted total.
    pub total: f64,
    /// Capability component.
    pub capability: f64,
    /// Latency (speed) component.
    pub latency: f64,
    /// Cost (cheapness) component.
    pub cost: f64,
    /// Historical reward component.
    pub historical: f64,
}

/// The router's decision, emitted to the client in a `router` meta event (§3).
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    /// Chosen provider.
    pub provider: String,
    /// Chosen model.
    pub model: String,
    /// Human-readable justification.
    pub reason: String,
    /// Every viable candidate's score, for observability.
    pub scores: Vec<CandidateScore>,
}

/// Exploration rate: with this probability the router picks the second-best
/// candidate instead of the top one, to keep historical scores honest (§4.7).
pub const EXPLORATION_EPSILON: f64 = 0.1;

/// Deterministic stand-in for a coin flip: identical classification inputs must pick
/// the same branch every time, so two concurrent identical requests route (and hence
/// coalesce) the same way (§9). Hashes the classification fingerprint with blake3 and
/// maps the leading 8 bytes onto `[0, 1)`.
fn deterministic_explore(fingerprint: &str) -> bool {
    let hash = blake3::hash(fingerprint.as_bytes());
    let leading = u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("8 bytes"));
    let frac = leading as f64 / u64::MAX as f64;
    frac < EXPLORATION_EPSILON
}

/// Scoring weights, which vary by [`Priority`] (§4.7).
struct Weights {
    capability: f64,
    latency: f64,
    cost: f64,
    historical: f64,
}

fn weights_for(priority: Priority) -> Weights {
    match priority {
        Priority::Quality => Weights { capability: 0.5, latency: 0.2, cost: 0.1, historical: 0.2 },
        Priority::Speed => Weights { capability: 0.2, latency: 0.5, cost: 0.1, historical: 0.2 },
        Priority::Cost => Weights { capability: 0.2, latency: 0.1, cost: 0.5, historical: 0.2 },
    }
}

/// A (typically cheap LLM-backed) intent classifier. Malformed output must never
/// raise — implementations should fall back to [`Classification::default`].
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Classify the current user message in light of prior turns.
    async fn classify(&self, user_message: &str, history: &[Turn]) -> Classification;
}

/// Keyword-based classifier requiring no upstream call. Used as the default so the
/// router never depends on a live provider to make a routing decision.
#[derive(Default)]
pub struct HeuristicClassifier;

#[async_trait]
impl IntentClassifier for HeuristicClassifier {
    async fn classify(&self, user_message: &str, _history: &[Turn]) -> Classification {
        let lower = user_message.to_lowercase();
        let task_type = if lower.contains("fn ") || lower.contains("code") || lower.contains("bug") {
            TaskType::Coding
        } else if lower.contains("latest") || lower.contains("news") || lower.contains("today") {
            TaskType::WebResearch
        } else if lower.contains("prove") || lower.contains("why") || lower.contains("reason") {
            TaskType::DeepReasoning
        } else if lower.contains("summarize") || lower.contains("tl;dr") {
            TaskType::Summarization
        } else if lower.contains("calculate") || lower.contains("solve") || lower.contains('=') {
            TaskType::Math
        } else if lower.contains("story") || lower.contains("poem") {
            TaskType::CreativeWriting
        } else {
            TaskType::GenericChat
        };
        let priority = match task_type {
            TaskType::DeepReasoning | TaskType::Coding => Priority::Quality,
            TaskType::WebResearch => Priority::Speed,
            _ => Priority::Quality,
        };
        Classification {
            task_type,
            priority,
            requires_web: matches!(task_type, TaskType::WebResearch),
            estimated_input_tokens: gateway_tokenizer::count_tokens(user_message),
        }
    }
}

/// Provider-selection interface (§4.7). Implementations must be deterministic in the
/// sense required for coalescing: equivalent inputs produce equivalent decisions.
#[async_trait]
pub trait DynamicRouter: Send + Sync {
    /// Score `candidates` for `user_message`/`history` and return the chosen route.
    async fn route(
        &self,
        user_message: &str,
        history: &[Turn],
        candidates: &[ProviderCandidate],
    ) -> Option<RouteDecision>;
}

/// Default router: heuristic classification plus weighted scoring with ε-greedy
/// exploration (§4.7).
pub struct HeuristicRouter {
    classifier: Box<dyn IntentClassifier>,
}

impl HeuristicRouter {
    /// Build a router using the given classifier.
    #[must_use]
    pub fn new(classifier: Box<dyn IntentClassifier>) -> Self {
        Self { classifier }
    }
}

impl Default for HeuristicRouter {
    fn default() -> Self {
        Self::new(Box::new(HeuristicClassifier))
    }
}

#[async_trait]
impl DynamicRouter for HeuristicRouter {
    async fn route(
        &self,
        user_message: &str,
        history: &[Turn],
        candidates: &[ProviderCandidate],
    ) -> Option<RouteDecision> {
        let classification = self.classifier.classify(user_message, history).await;

        let viable: Vec<&ProviderCandidate> = candidates
            .iter()
            .filter(|c| c.max_context_tokens >= classification.estimated_input_tokens)
            .collect();
        if viable.is_empty() {
            return None;
        }

        let weights = weights_for(classification.priority);
        let mut scored: Vec<CandidateScore> = viable
            .iter()
            .map(|c| {
                let historical = c.historical_reward();
                let total = weights.capability * c.capability
                    + weights.latency * c.speed
                    + weights.cost * c.cheapness
                    + weights.historical * historical;
                CandidateScore {
                    provider: c.provider.clone(),
                    model: c.model.clone(),
                    total,
                    capability: c.capability,
                    latency: c.speed,
                    cost: c.cheapness,
                    historical,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.total.partial_cmp(&a.total).unwrap_or(std::cmp::Ordering::Equal));

        let fingerprint = format!(
            "{:?}|{:?}|{}|{}",
            classification.task_type, classification.priority, classification.estimated_input_tokens, user_message
        );
        let chosen_index = if scored.len() > 1 && deterministic_explore(&fingerprint) { 1 } else { 0 };
        let chosen = &scored[chosen_index];
        let reason = if chosen_index == 0 {
            format!("best score for task {:?} with priority {:?}", classification.task_type, classification.priority)
        } else {
            "exploration: second-best candidate selected".to_string()
        };

        Some(RouteDecision {
            provider: chosen.provider.clone(),
            model: chosen.model.clone(),
            reason,
            scores: scored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(provider: &str, capability: f64, speed: f64, cheapness: f64) -> ProviderCandidate {
        ProviderCandidate {
            provider: provider.to_string(),
            model: "m1".to_string(),
            capability,
            speed,
            cheapness,
            max_context_tokens: 100_000,
            positive_feedback: 0,
            negative_feedback: 0,
            attempts: 0,
        }
    }

    #[test]
    fn historical_reward_defaults_to_half_with_no_attempts() {
        let c = candidate("p", 0.5, 0.5, 0.5);
        assert!((c.historical_reward() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn filters_candidates_exceeding_context_window() {
        let router = HeuristicRouter::default();
        let fits = candidate("fits", 0.9, 0.9, 0.9);
        let mut too_small = candidate("too_small", 0.9, 0.9, 0.9);
        too_small.max_context_tokens = 0;
        let decision = router
            .route("hello world this is a longer message", &[], &[fits, too_small])
            .await
            .unwrap();
        assert_eq!(decision.scores.len(), 1);
        assert_eq!(decision.scores[0].provider, "fits");
    }

    #[tokio::test]
    async fn no_viable_candidates_returns_none() {
        let router = HeuristicRouter::default();
        let mut tiny = candidate("tiny", 0.9, 0.9, 0.9);
        tiny.max_context_tokens = 0;
        let decision = router.route("hello world this is a longer message", &[], &[tiny]).await;
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn identical_requests_always_route_identically() {
        let router = HeuristicRouter::default();
        let weak = candidate("weak", 0.1, 0.1, 0.1);
        let strong = candidate("strong", 0.9, 0.9, 0.9);
        // Same classification inputs must yield the same decision every time, so
        // concurrent identical requests land on the same coalesce key (§9).
        let first = router.route("hi", &[], &[weak.clone(), strong.clone()]).await.unwrap();
        for _ in 0..20 {
            let decision = router.route("hi", &[], &[weak.clone(), strong.clone()]).await.unwrap();
            assert_eq!(decision.provider, first.provider);
            assert_eq!(decision.model, first.model);
        }
    }

    #[test]
    fn deterministic_explore_is_pure_function_of_fingerprint() {
        let a = deterministic_explore("same|fingerprint");
        let b = deterministic_explore("same|fingerprint");
        assert_eq!(a, b);
    }
}
