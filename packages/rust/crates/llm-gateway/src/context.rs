//! Deterministically assembles the provider-bound `messages` array (§4.6).
//!
//! Order is strict: base system prompt, optional memory snippet, prior turns oldest
//! to newest, then the current user message (optionally composited with a rewrite).
//! [`MemoryProvider`] and [`QueryRewriter`] are external interfaces per §1 — out of
//! scope to implement, in scope to honor precisely. Both ship a safe no-op default so
//! the core never depends on an unimplemented collaborator.

use async_trait::async_trait;

use crate::thread_store::{MessageEnvelope, ThreadStore, Turn};

/// Bound on the injected memory snippet's length (§4.6).
pub const MAX_MEMORY_SNIPPET_CHARS: usize = 2000;
/// Rewriter timeout; past this, proceed with the original content (§4.6).
pub const REWRITER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Long-term memory / vector-search collaborator (§1, explicitly out of scope to
/// implement — this crate only depends on the interface).
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Fetch a memory snippet relevant to `user_message`, if any. Any error is
    /// treated as "no snippet" by the caller — see [`ContextBuilder::build`].
    async fn recall(&self, user_message: &str) -> anyhow::Result<Option<String>>;
}

/// Always returns no snippet. The default until `memory.enabled` wires a real
/// implementation in.
pub struct NoopMemoryProvider;

#[async_trait]
impl MemoryProvider for NoopMemoryProvider {
    async fn recall(&self, _user_message: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Non-destructive, fallback-on-failure query transformer that expands pronouns using
/// prior turns (§4.6, §9).
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    /// Attempt to rewrite `user_message` in light of `history`. Returning `Ok(None)`
    /// or erroring both fall back to the original content.
    async fn rewrite(&self, user_message: &str, history: &[Turn]) -> anyhow::Result<Option<String>>;
}

/// Returns the input unchanged. The default until `query_rewriter.enabled` wires a
/// real implementation in.
pub struct IdentityQueryRewriter;

#[async_trait]
impl QueryRewriter for IdentityQueryRewriter {
    async fn rewrite(&self, _user_message: &str, _history: &[Turn]) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Separator inserted between the original user content and a successful rewrite.
pub const REWRITE_SEPARATOR: &str = "\n\n[rewritten]: ";

/// Fixed base system prompt (first message in every assembled context, §4.6).
pub const BASE_SYSTEM_PROMPT: &str =
    "You are a helpful assistant responding through a multi-tenant LLM gateway.";

/// Builds the exact `messages` array dispatched to a provider, read-only on the
/// thread store (§4.6).
pub struct ContextBuilder {
    memory: Box<dyn MemoryProvider>,
    rewriter: Box<dyn QueryRewriter>,
    memory_enabled: bool,
    rewriter_enabled: bool,
}

impl ContextBuilder {
    /// Build a context builder with the given collaborators and feature flags
    /// (§6.4 `memory.enabled` / `query_rewriter.enabled`, both default false).
    #[must_use]
    pub fn new(
        memory: Box<dyn MemoryProvider>,
        rewriter: Box<dyn QueryRewriter>,
        memory_enabled: bool,
        rewriter_enabled: bool,
    ) -> Self {
        Self { memory, rewriter, memory_enabled, rewriter_enabled }
    }

    /// Assemble the `messages` array for `thread_id`'s current turn.
    ///
    /// MUST be called before the current user message is appended to the thread
    /// store — loading history and writing the new turn must never race (§4.6, §9).
    /// `request_use_memory`/`request_use_rewriter` are per-request opt-ins (§6.1);
    /// the effective flag is the configured default AND the per-request request.
    pub async fn build(
        &self,
        thread_store: &ThreadStore,
        thread_id: &str,
        user_message: &str,
        max_turns: usize,
    ) -> Vec<MessageEnvelope> {
        self.build_with_overrides(thread_store, thread_id, user_message, max_turns, true, true).await
    }

    /// As [`Self::build`], but lets a caller narrow the configured memory/rewriter
    /// flags per request (§6.1 `use_memory`, `use_query_rewriter`).
    pub async fn build_with_overrides(
        &self,
        thread_store: &ThreadStore,
        thread_id: &str,
        user_message: &str,
        max_turns: usize,
        request_use_memory: bool,
        request_use_rewriter: bool,
    ) -> Vec<MessageEnvelope> {
        let memory_enabled = self.memory_enabled && request_use_memory;
        let rewriter_enabled = self.rewriter_enabled && request_use_rewriter;
        let mut messages = vec![MessageEnvelope::new("system", BASE_SYSTEM_PROMPT)];

        if memory_enabled {
            match self.memory.recall(user_message).await {
                Ok(Some(snippet)) if !snippet.is_empty() => {
                    let bounded: String = snippet.chars().take(MAX_MEMORY_SNIPPET_CHARS).collect();
                    messages.push(MessageEnvelope::new("system", bounded));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        event = "context.memory_recall_failed",
                        thread_id,
                        error = %err,
                        "memory retrieval failed, proceeding without a memory message"
                    );
                }
            }
        }

        // History MUST be loaded before the current user message is appended anywhere.
        let history = thread_store.get_history(thread_id, max_turns);
        messages.extend(history.iter().map(MessageEnvelope::from));

        let final_user_content = if rewriter_enabled {
            match tokio::time::timeout(REWRITER_TIMEOUT, self.rewriter.rewrite(user_message, &history)).await {
                Ok(Ok(Some(rewritten))) if !rewritten.is_empty() => {
                    format!("{user_message}{REWRITE_SEPARATOR}{rewritten}")
                }
                Ok(Ok(_)) => user_message.to_string(),
                Ok(Err(err)) => {
                    tracing::warn!(
                        event = "context.rewriter_failed",
                        thread_id,
                        error = %err,
                        "query rewriter failed, proceeding with original content"
                    );
                    user_message.to_string()
                }
                Err(_) => {
                    tracing::warn!(
                        event = "context.rewriter_timeout",
                        thread_id,
                        "query rewriter exceeded 1s, proceeding with original content"
                    );
                    user_message.to_string()
                }
            }
        } else {
            user_message.to_string()
        };

        messages.push(MessageEnvelope::new("user", final_user_content));
        messages
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(Box::new(NoopMemoryProvider), Box::new(IdentityQueryRewriter), false, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_store::Turn;

    struct FailingMemory;
    #[async_trait]
    impl MemoryProvider for FailingMemory {
        async fn recall(&self, _user_message: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    struct FailingRewriter;
    #[async_trait]
    impl QueryRewriter for FailingRewriter {
        async fn rewrite(&self, _user_message: &str, _history: &[Turn]) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    #[tokio::test]
    async fn default_builder_produces_system_then_history_then_user() {
        let store = ThreadStore::new();
        store.append_turn("t1", Turn::new("user", "hi"));
        store.append_turn("t1", Turn::new("assistant", "hello"));
        let builder = ContextBuilder::default();
        let messages = builder.build(&store, "t1", "what's up", 10).await;
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "hi");
        assert_eq!(messages[2].content, "hello");
        assert_eq!(messages[3].role, "user");
        assert_eq!(messages[3].content, "what's up");
    }

    #[tokio::test]
    async fn memory_failure_falls_back_without_aborting() {
        let store = ThreadStore::new();
        let builder = ContextBuilder::new(Box::new(FailingMemory), Box::new(IdentityQueryRewriter), true, false);
        let messages = builder.build(&store, "t1", "hi", 10).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
    }

    #[tokio::test]
    async fn rewriter_failure_falls_back_to_original_content() {
        let store = ThreadStore::new();
        let builder = ContextBuilder::new(Box::new(NoopMemoryProvider), Box::new(FailingRewriter), false, true);
        let messages = builder.build(&store, "t1", "original", 10).await;
        assert_eq!(messages.last().unwrap().content, "original");
    }

    #[tokio::test]
    async fn history_loaded_before_current_message_is_appended() {
        let store = ThreadStore::new();
        store.append_turn("t1", Turn::new("user", "prior"));
        let builder = ContextBuilder::default();
        let messages = builder.build(&store, "t1", "current", 10).await;
        // Context build must not have mutated the thread: only the prior turn exists.
        assert_eq!(store.get_history("t1", 10).len(), 1);
        assert_eq!(messages.last().unwrap().content, "current");
    }
}
