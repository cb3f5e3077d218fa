//! llm-gateway: multi-tenant LLM gateway with a coalesced, fanned-out, paced
//! streaming dispatch core.
//!
//! The hot path is **Context Builder → Dynamic Router → Coalescer → Pacer → Shared
//! Client → Provider → Stream Hub → SSE**, wired together in [`dispatch`].

#![allow(missing_docs)]

pub mod cli;
pub mod coalescer;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod gateway;
pub mod http_client;
pub mod hub;
pub mod metrics;
pub mod pacer;
pub mod provider;
pub mod router;
pub mod sse;
pub mod thread_store;

pub use coalescer::{Coalescer, CoalesceKey, LeaderOutput, Role};
pub use config::RuntimeSettings;
pub use context::{ContextBuilder, IdentityQueryRewriter, MemoryProvider, NoopMemoryProvider, QueryRewriter};
pub use dispatch::{DispatchOutcome, DispatchRequest, GatewayState, dispatch};
pub use errors::GatewayError;
pub use gateway::{MessageRequest, MessageResponse, router, run_http};
pub use hub::{HubEvent, StreamHub, Subscriber};
pub use metrics::{MetricsRegistry, MetricsSnapshot, RequestRecord};
pub use pacer::{PacerRegistry, ProviderPacer};
pub use provider::{OpenAiCompatibleAdapter, ProviderAdapter, ProviderEvent};
pub use router::{DynamicRouter, HeuristicRouter, ProviderCandidate, RouteDecision};
pub use thread_store::{MessageEnvelope, ThreadStore, Turn};
