//! In-memory, process-wide mapping of `thread_id` to an ordered turn list.
//!
//! Strict read/write separation: `get` and `get_history` never create or mutate a
//! thread; `get_or_create` and `append_turn` are the only write paths. Each thread is
//! backed by a [`gateway_window::SessionWindow`] so history is bounded to the last N
//! turns without unbounded memory growth, with pair-aligned eviction at the boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use gateway_window::{SessionWindow, TurnSlot};
use serde::{Deserialize, Serialize};

/// One turn in a conversation thread.
///
/// Immutable after append; `role` is one of `user`, `assistant`, `system`, or `tool`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    /// `user`, `assistant`, `system`, or `tool`.
    pub role: String,
    /// Message content.
    pub content: String,
    /// Monotonic timestamp recorded at append time, milliseconds since `UNIX_EPOCH`.
    pub created_at: u64,
}

impl Turn {
    /// Build a turn with the current monotonic timestamp.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            created_at: monotonic_ts_ms(),
        }
    }
}

impl From<&TurnSlot> for Turn {
    fn from(slot: &TurnSlot) -> Self {
        Self {
            role: slot.role.clone(),
            content: slot.content.clone(),
            created_at: slot.created_at,
        }
    }
}

/// The provider-bound message shape, decoupled from [`Turn`] so system and memory
/// messages can be injected into a request without polluting the persisted thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message content sent to the provider.
    pub content: String,
}

impl MessageEnvelope {
    /// Build an envelope from role and content.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

impl From<&Turn> for MessageEnvelope {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.clone(),
            content: turn.content.clone(),
        }
    }
}

fn monotonic_ts_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Default sliding-window capacity: last 50 turns per thread (§4.1).
pub const DEFAULT_WINDOW_TURNS: usize = 50;

/// A single conversation thread. Turn append is serialized by its own mutex so
/// concurrent appends on different threads never contend with each other.
struct Thread {
    window: Mutex<SessionWindow>,
}

/// In-memory, process-wide thread store.
///
/// `get`/`get_history` are read-only; `get_or_create`/`append_turn` are the only write
/// paths. A thread object, once created, is never replaced — only its window mutates.
pub struct ThreadStore {
    threads: RwLock<HashMap<String, Arc<Thread>>>,
    window_turns: usize,
}

impl ThreadStore {
    /// Build a store with the default 50-turn window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW_TURNS)
    }

    /// Build a store with an explicit per-thread window size.
    #[must_use]
    pub fn with_window(window_turns: usize) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            window_turns,
        }
    }

    fn existing(&self, thread_id: &str) -> Option<Arc<Thread>> {
        self.threads.read().ok()?.get(thread_id).cloned()
    }

    /// Read-only lookup. Never creates a thread.
    #[must_use]
    pub fn get(&self, thread_id: &str) -> Option<Vec<Turn>> {
        let thread = self.existing(thread_id)?;
        let window = thread.window.lock().ok()?;
        Some(window.get_recent_turns(self.window_turns).iter().map(Turn::from).collect())
    }

    /// Idempotent write-path lookup: creates the thread object if absent.
    pub fn get_or_create(&self, thread_id: &str) {
        if self.existing(thread_id).is_some() {
            return;
        }
        let mut threads = match self.threads.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        threads.entry(thread_id.to_string()).or_insert_with(|| {
            Arc::new(Thread {
                window: Mutex::new(SessionWindow::new(thread_id, self.window_turns)),
            })
        });
    }

    /// Append a turn in call order; visible to any subsequent `get`/`get_history` call.
    pub fn append_turn(&self, thread_id: &str, turn: Turn) {
        self.get_or_create(thread_id);
        let Some(thread) = self.existing(thread_id) else {
            return;
        };
        if let Ok(mut window) = thread.window.lock() {
            tracing::debug!(
                event = "thread.append_turn",
                thread_id,
                role = turn.role.as_str(),
                "appended turn to thread"
            );
            window.append_turn(&turn.role, &turn.content, turn.created_at);
        }
    }

    /// Last `max_turns` turns in chronological order. Empty if the thread is absent.
    /// Never mutates.
    #[must_use]
    pub fn get_history(&self, thread_id: &str, max_turns: usize) -> Vec<Turn> {
        let Some(thread) = self.existing(thread_id) else {
            return Vec::new();
        };
        let Ok(window) = thread.window.lock() else {
            return Vec::new();
        };
        window.get_recent_turns(max_turns).iter().map(Turn::from).collect()
    }

    /// Explicit reset. Not called on normal request paths.
    pub fn clear(&self, thread_id: &str) {
        let mut threads = match self.threads.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        threads.remove(thread_id);
        tracing::debug!(event = "thread.clear", thread_id, "thread cleared");
    }
}

impl Default for ThreadStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_read_only_and_returns_none_for_absent_thread() {
        let store = ThreadStore::new();
        assert!(store.get("missing").is_none());
        assert!(store.existing("missing").is_none());
    }

    #[test]
    fn append_is_visible_to_immediate_get_history() {
        let store = ThreadStore::new();
        store.append_turn("t1", Turn::new("user", "hi"));
        let history = store.get_history("t1", 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[test]
    fn append_turn_preserves_call_order() {
        let store = ThreadStore::new();
        store.append_turn("t1", Turn::new("user", "first"));
        store.append_turn("t1", Turn::new("assistant", "second"));
        let history = store.get_history("t1", 10);
        assert_eq!(history[0].content, "first");
        assert_eq!(history[1].content, "second");
    }

    #[test]
    fn clear_resets_thread_to_empty() {
        let store = ThreadStore::new();
        store.append_turn("t1", Turn::new("user", "hi"));
        store.clear("t1");
        assert!(store.get("t1").is_none());
    }

    #[test]
    fn capacity_eviction_preserves_pair_alignment() {
        let store = ThreadStore::with_window(4);
        for i in 0..6 {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            store.append_turn("t1", Turn::new(role, i.to_string()));
        }
        let history = store.get_history("t1", 100);
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "2");
        assert_eq!(history[0].role, "user");
    }
}
