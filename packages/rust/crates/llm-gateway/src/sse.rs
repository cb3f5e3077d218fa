//! SSE wire protocol (§6.2): translates [`HubEvent`]s into `axum` SSE frames with the
//! correct event names, heartbeat cadence, and anti-buffering response headers.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;

use crate::hub::{HubEvent, Subscriber};

/// Heartbeat interval when no delta has been sent (§6.2, §6.4 `heartbeat.interval_ms`).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Translate one [`HubEvent`] into a named SSE frame with JSON data.
///
/// # Panics
/// Never panics: every variant here has a `Serialize` impl that cannot fail on these
/// plain-data shapes.
#[must_use]
pub fn encode_event(event: &HubEvent) -> Event {
    let (name, payload) = match event {
        HubEvent::Ping => ("ping", serde_json::json!({})),
        HubEvent::Router(decision) => ("router", serde_json::to_value(decision).unwrap_or_default()),
        HubEvent::Meta { ttft_ms, queue_wait_ms, provider, model } => (
            "meta",
            serde_json::json!({
                "ttft_ms": ttft_ms,
                "queue_wait_ms": queue_wait_ms,
                "provider": provider,
                "model": model,
            }),
        ),
        HubEvent::Delta { content } => ("delta", serde_json::json!({"type": "delta", "content": content})),
        HubEvent::Dropped { count } => ("dropped", serde_json::json!({"count": count})),
        HubEvent::Done { total_ms, final_hash } => (
            "done",
            serde_json::json!({"total_ms": total_ms, "final_hash": final_hash, "usage": {}}),
        ),
        HubEvent::Error(body) => ("error", serde_json::to_value(body).unwrap_or_default()),
    };
    Event::default().event(name).data(payload.to_string())
}

/// Turn a hub [`Subscriber`] into an `axum` SSE response stream, with a `ping`
/// heartbeat whenever no event has arrived for [`DEFAULT_HEARTBEAT_INTERVAL`].
pub fn subscriber_into_sse(mut subscriber: Subscriber, heartbeat_interval: Duration) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        loop {
            let next = tokio::time::timeout(heartbeat_interval, subscriber.recv()).await;
            match next {
                Ok(Some(event)) => {
                    let is_terminal = matches!(event, HubEvent::Done { .. } | HubEvent::Error(_));
                    yield Ok(encode_event(&event));
                    if is_terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => yield Ok(encode_event(&HubEvent::Ping)),
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
