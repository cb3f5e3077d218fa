//! Maps a request fingerprint to at-most-one in-flight computation (§4.2).
//!
//! The first caller for a given key becomes the leader and runs `leader_fn` to
//! completion; every concurrent or subsequent caller with the same key during the
//! in-flight window is a follower that awaits the same [`LeaderOutput`]. Implemented
//! with `tokio::sync::watch` rather than a condvar: the leader creates a
//! `watch::channel(None)`, runs its body, and sends `Some(result)` on completion;
//! followers `.changed().await` on a receiver clone and read the resolved value. This
//! gives every follower a cheap, cancellation-safe subscription without a wakeup list.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

use crate::errors::GatewayError;

/// Opaque deterministic fingerprint over `(provider, model, normalized messages)`.
///
/// Equality implies semantic request equivalence; a hash collision between
/// non-equivalent requests is a correctness bug (§3).
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct CoalesceKey(String);

impl CoalesceKey {
    /// Wrap an already-computed fingerprint (hex digest or similar opaque string).
    #[must_use]
    pub fn new(fingerprint: String) -> Self {
        Self(fingerprint)
    }

    /// Build the key from `(provider, model, messages)` using blake3 over the
    /// canonical JSON encoding, per the Open Question resolution in DESIGN.md.
    #[must_use]
    pub fn from_request(provider: &str, model: &str, messages: &[crate::thread_store::MessageEnvelope]) -> Self {
        #[derive(serde::Serialize)]
        struct Canonical<'a> {
            provider: &'a str,
            model: &'a str,
            messages: &'a [crate::thread_store::MessageEnvelope],
        }
        let canonical = Canonical { provider, model, messages };
        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(blake3::hash(&json).to_hex().to_string())
    }
}

impl fmt::Debug for CoalesceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoalesceKey({})", &self.0[..self.0.len().min(12)])
    }
}

/// What followers observe once the leader completes.
#[derive(Clone, Debug)]
pub struct LeaderOutput {
    /// Final assistant content, as accumulated by the leader.
    pub final_content: String,
    /// Time to first upstream byte, milliseconds.
    pub ttft_ms: u64,
    /// Time spent waiting in the pacer before the upstream call, milliseconds.
    pub queue_wait_ms: u64,
    /// Number of retries the leader performed.
    pub retries: u32,
}

type SharedResult = Result<LeaderOutput, GatewayError>;

struct InflightEntry {
    tx: watch::Sender<Option<SharedResult>>,
    created_at: Instant,
    waiters: Arc<std::sync::atomic::AtomicUsize>,
    /// Set once the leader sends a failure, to drive the negative-cache window.
    /// Left `None` on success, since a successful entry is evicted immediately.
    failed_at: Mutex<Option<Instant>>,
}

/// Default TTL from entry creation (§3 `InflightEntry`).
pub const ENTRY_TTL: Duration = Duration::from_secs(30);
/// Negative-cache window after a leader failure: callers that arrive within this
/// window of a failed leader observe the cached failure instead of re-running
/// `leader_fn` (§4.2, §7).
pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(2);
/// Nominal minimum a leader keeps running after its last waiter drops, per §4.2.
/// `leader_fn` here always runs to completion regardless of waiter count — it is
/// never selected against cancellation — so this bound holds trivially and there is
/// no separate grace-period timer to wire up.
pub const LEADER_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// In-flight request deduplicator. One instance per process (§5 shared resources).
#[derive(Default)]
pub struct Coalescer {
    inflight: Mutex<HashMap<CoalesceKey, Arc<InflightEntry>>>,
}

/// Role assumed by a caller entering [`Coalescer::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This caller is running `leader_fn`.
    Leader,
    /// This caller is awaiting another caller's result.
    Follower,
}

impl Coalescer {
    /// Build an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-insert followed by either running `leader_fn` (leader) or
    /// awaiting the leader's broadcast (follower). `on_role` is invoked synchronously
    /// with the assigned role before the leader body starts, so callers can emit
    /// `coalesce.leaders` / `coalesce.followers` metrics and hub-subscribe logic at
    /// the right moment.
    pub async fn run<F, Fut>(
        &self,
        key: CoalesceKey,
        leader_fn: F,
        on_role: impl FnOnce(Role),
    ) -> SharedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SharedResult>,
    {
        let (entry, role) = self.enter(key.clone()).await;
        on_role(role);

        match role {
            Role::Leader => {
                let result = leader_fn().await;
                let _ = entry.tx.send(Some(result.clone()));
                if result.is_ok() {
                    self.evict_if_current(&key, &entry).await;
                } else {
                    // Keep the failed entry around for NEGATIVE_CACHE_TTL so a burst of
                    // retries against the same key doesn't re-invoke leader_fn per caller.
                    *entry.failed_at.lock().await = Some(Instant::now());
                }
                result
            }
            Role::Follower => {
                let mut rx = entry.tx.subscribe();
                entry.waiters.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let outcome = loop {
                    if let Some(result) = rx.borrow().clone() {
                        break result;
                    }
                    if rx.changed().await.is_err() {
                        break Err(GatewayError::Timeout("leader vanished".into()));
                    }
                };
                entry.waiters.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                outcome
            }
        }
    }

    async fn enter(&self, key: CoalesceKey) -> (Arc<InflightEntry>, Role) {
        let mut map = self.inflight.lock().await;
        if let Some(existing) = map.get(&key) {
            let failed_at = *existing.failed_at.lock().await;
            match failed_at {
                Some(at) if at.elapsed() < NEGATIVE_CACHE_TTL => {
                    return (Arc::clone(existing), Role::Follower);
                }
                None if existing.created_at.elapsed() < ENTRY_TTL => {
                    return (Arc::clone(existing), Role::Follower);
                }
                // Negative-cache window expired, or the in-flight entry is stale: fall
                // through and replace it with a fresh leader below.
                _ => {}
            }
        }
        let (tx, _rx) = watch::channel(None);
        let entry = Arc::new(InflightEntry {
            tx,
            created_at: Instant::now(),
            waiters: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            failed_at: Mutex::new(None),
        });
        map.insert(key, Arc::clone(&entry));
        (entry, Role::Leader)
    }

    async fn evict_if_current(&self, key: &CoalesceKey, entry: &Arc<InflightEntry>) {
        let mut map = self.inflight.lock().await;
        if let Some(current) = map.get(key) {
            if Arc::ptr_eq(current, entry) {
                map.remove(key);
            }
        }
    }

    /// Number of waiters currently subscribed to the entry for `key`, if any.
    pub async fn waiter_count(&self, key: &CoalesceKey) -> usize {
        let map = self.inflight.lock().await;
        map.get(key)
            .map(|e| e.waiters.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(s: &str) -> CoalesceKey {
        CoalesceKey::new(s.to_string())
    }

    #[tokio::test]
    async fn single_caller_becomes_leader_and_succeeds() {
        let c = Coalescer::new();
        let result = c
            .run(
                key("a"),
                || async {
                    Ok(LeaderOutput {
                        final_content: "hi".into(),
                        ttft_ms: 1,
                        queue_wait_ms: 0,
                        retries: 0,
                    })
                },
                |role| assert_eq!(role, Role::Leader),
            )
            .await
            .unwrap();
        assert_eq!(result.final_content, "hi");
    }

    #[tokio::test]
    async fn concurrent_identical_callers_invoke_leader_fn_exactly_once() {
        let c = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let c = Arc::clone(&c);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                c.run(
                    key("burst"),
                    || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(LeaderOutput {
                                final_content: "hi".into(),
                                ttft_ms: 1,
                                queue_wait_ms: 0,
                                retries: 0,
                            })
                        }
                    },
                    |_role| {},
                )
                .await
            }));
        }

        for h in handles {
            let result = h.await.unwrap().unwrap();
            assert_eq!(result.final_content, "hi");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn leader_failure_is_delivered_to_followers() {
        let c = Arc::new(Coalescer::new());
        let mut handles = Vec::new();
        for _ in 0..5 {
            let c = Arc::clone(&c);
            handles.push(tokio::spawn(async move {
                c.run(
                    key("failing"),
                    || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(GatewayError::UpstreamFatal("boom".into()))
                    },
                    |_role| {},
                )
                .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn failed_entry_is_reused_as_negative_cache_within_ttl() {
        let c = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let run_once = |c: Arc<Coalescer>, calls: Arc<AtomicUsize>| async move {
            c.run(
                key("flaky"),
                move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(GatewayError::UpstreamFatal("boom".into()))
                    }
                },
                |_role| {},
            )
            .await
        };

        assert!(run_once(Arc::clone(&c), Arc::clone(&calls)).await.is_err());
        assert!(run_once(Arc::clone(&c), Arc::clone(&calls)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entry_is_evicted_after_completion_so_next_request_leads() {
        let c = Coalescer::new();
        let _ = c
            .run(key("k"), || async { Ok(LeaderOutput { final_content: "a".into(), ttft_ms: 0, queue_wait_ms: 0, retries: 0 }) }, |_| {})
            .await;
        let mut saw_leader = false;
        let _ = c
            .run(
                key("k"),
                || async { Ok(LeaderOutput { final_content: "b".into(), ttft_ms: 0, queue_wait_ms: 0, retries: 0 }) },
                |role| saw_leader = role == Role::Leader,
            )
            .await;
        assert!(saw_leader);
    }
}
