//! Session window: bounded ring buffer of `TurnSlot`s, truncated on pair boundaries.

use std::collections::VecDeque;

use crate::TurnSlot;

/// Bounded session window for recent turns. O(1) append, drop-oldest when over capacity.
///
/// Eviction preserves complete user/assistant pairs at the truncation boundary: the
/// retained window never starts with a lone assistant turn whose question was dropped.
/// When the oldest two turns form a user/assistant pair, both are dropped together;
/// otherwise a single unpaired leading turn (e.g. a lone in-flight user turn) is dropped.
#[derive(Debug)]
pub struct SessionWindow {
    thread_id: String,
    ring: VecDeque<TurnSlot>,
    max_turns: usize,
}

impl SessionWindow {
    /// Create a session window with a fixed capacity.
    #[must_use]
    pub fn new(thread_id: &str, max_turns: usize) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            ring: VecDeque::with_capacity(max_turns.min(4096)),
            max_turns: max_turns.max(1),
        }
    }

    /// Append one turn, evicting from the front (pair-aligned) if over capacity.
    pub fn append_turn(&mut self, role: &str, content: &str, created_at: u64) {
        self.ring.push_back(TurnSlot::new(role, content, created_at));
        self.evict_to_capacity();
    }

    fn evict_to_capacity(&mut self) {
        while self.ring.len() > self.max_turns {
            let pair_aligned = self.ring.front().is_some_and(TurnSlot::is_user)
                && self.ring.get(1).is_some_and(TurnSlot::is_assistant);
            if pair_aligned {
                self.ring.pop_front();
                self.ring.pop_front();
            } else {
                self.ring.pop_front();
            }
        }
    }

    /// Last `max_turns` turns for context building (oldest to newest).
    #[must_use]
    pub fn get_recent_turns(&self, max_turns: usize) -> Vec<&TurnSlot> {
        let n = self.ring.len().min(max_turns);
        if n == 0 {
            return Vec::new();
        }
        let mut out: Vec<&TurnSlot> = self.ring.iter().rev().take(n).collect();
        out.reverse();
        out
    }

    /// The most recently appended turn, if any.
    #[must_use]
    pub fn last(&self) -> Option<&TurnSlot> {
        self.ring.back()
    }

    /// Number of turns currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// `true` when no turns are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Thread identifier this window belongs to.
    #[must_use]
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_recent_preserve_order() {
        let mut w = SessionWindow::new("t1", 10);
        w.append_turn("user", "hello", 1);
        w.append_turn("assistant", "hi", 2);
        let recent = w.get_recent_turns(5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].role, "user");
        assert_eq!(recent[1].role, "assistant");
    }

    #[test]
    fn eviction_is_pair_aligned() {
        let mut w = SessionWindow::new("t1", 4);
        for i in 0..6 {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            w.append_turn(role, &i.to_string(), i);
        }
        assert_eq!(w.len(), 4);
        let recent = w.get_recent_turns(10);
        // truncation boundary lands on a user turn, never a lone assistant
        assert!(recent[0].is_user());
        assert_eq!(recent[0].content, "2");
    }

    #[test]
    fn unpaired_leading_turn_evicts_alone() {
        let mut w = SessionWindow::new("t1", 2);
        w.append_turn("system", "base prompt", 0);
        w.append_turn("user", "hi", 1);
        w.append_turn("assistant", "hello", 2);
        assert_eq!(w.len(), 2);
        let recent = w.get_recent_turns(10);
        assert_eq!(recent[0].role, "user");
        assert_eq!(recent[1].role, "assistant");
    }
}
