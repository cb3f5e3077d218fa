//! Gateway namespace: the HTTP entrypoint (§6.1).

mod http;

pub use http::{
    GatewayHealthResponse, MessageRequest, MessageResponse, router, run_http,
    validate_message_request,
};
