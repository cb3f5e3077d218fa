//! Single turn in the session window.

use serde::{Deserialize, Serialize};

/// One turn (user, assistant, system, or tool) with a monotonic timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[must_use]
pub struct TurnSlot {
    /// Role: "user", "assistant", "system", or "tool".
    pub role: String,
    /// Message content. Immutable once appended.
    pub content: String,
    /// Monotonic timestamp recorded at append time.
    pub created_at: u64,
}

impl TurnSlot {
    /// Build a turn slot from role, content, and a monotonic timestamp.
    pub fn new(role: &str, content: &str, created_at: u64) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            created_at,
        }
    }

    /// `true` for `role == "user"`.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.role == "user"
    }

    /// `true` for `role == "assistant"`.
    #[must_use]
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}
