//! Upstream provider contract (§6.3): adapters decode a provider's native streaming
//! framing into the unified [`ProviderEvent`] stream. The concrete adapter here talks
//! to any OpenAI-compatible chat-completions endpoint.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::thread_store::MessageEnvelope;

/// Decoded event from an upstream provider's stream, independent of wire format.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A content chunk.
    Delta {
        /// The chunk content.
        content: String,
    },
    /// Usage/accounting metadata, when the provider reports it.
    UsageMeta {
        /// Prompt tokens, if reported.
        prompt_tokens: Option<u64>,
        /// Completion tokens, if reported.
        completion_tokens: Option<u64>,
    },
    /// A terminal provider-side error.
    Error {
        /// HTTP status, if applicable.
        http_status: Option<u16>,
        /// Raw error body.
        body: String,
    },
    /// Normal stream end.
    End,
}

/// Per-request overrides the dispatch pipeline may pass to a provider call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Sampling temperature, when the caller wants a non-default value.
    pub temperature: Option<f32>,
    /// Max tokens to generate, when bounded.
    pub max_tokens: Option<u32>,
}

/// Adapter contract every provider implementation must satisfy (§6.3). Adapters MUST
/// use the shared HTTP client, set `stream: true`, and emit at least one event
/// (`Delta` or `End`) within the overall request timeout.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stream a chat completion for `messages` against `model`.
    async fn stream(
        &self,
        messages: &[MessageEnvelope],
        model: &str,
        options: &RequestOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>, GatewayError>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [MessageEnvelope],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsageField>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: DeltaField,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct DeltaField {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsageField {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

/// OpenAI-compatible chat-completions adapter, speaking `text/event-stream` SSE
/// framing (`data: {...}\n\n`, terminated by `data: [DONE]\n\n`).
pub struct OpenAiCompatibleAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleAdapter {
    /// Build an adapter against `base_url` (e.g. `https://api.openai.com/v1/chat/completions`)
    /// using the shared process-wide client.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self { client, base_url: base_url.into(), api_key }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    async fn stream(
        &self,
        messages: &[MessageEnvelope],
        model: &str,
        options: &RequestOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>, GatewayError> {
        let body = ChatCompletionRequest {
            model,
            messages,
            stream: true,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let mut request = self
            .client
            .post(&self.base_url)
            .header("Accept-Encoding", "identity")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                GatewayError::Timeout(format!("upstream connect timeout: {err}"))
            } else {
                GatewayError::UpstreamTransient(format!("upstream request failed: {err}"))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::RateLimited {
                message: "upstream returned 429".into(),
                retry_after_ms: response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|secs| secs * 1000),
            });
        }
        if status.is_server_error() {
            return Err(GatewayError::UpstreamTransient(format!("upstream status {status}")));
        }
        if !status.is_success() {
            return Err(GatewayError::UpstreamFatal(format!("upstream status {status}")));
        }

        let byte_stream = response.bytes_stream();
        let events = decode_sse_stream(byte_stream);
        Ok(Box::pin(events))
    }
}

/// Decode an OpenAI-compatible SSE byte stream into [`ProviderEvent`]s. Lines are
/// buffered until a full `data: ...\n\n` frame is available; `[DONE]` yields `End`.
fn decode_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = ProviderEvent> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
        tokio::pin!(byte_stream);
        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(err) => {
                    yield ProviderEvent::Error { http_status: None, body: err.to_string() };
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find("\n\n") {
                let frame = buffer[..pos].to_string();
                buffer.drain(..pos + 2);
                for line in frame.lines() {
                    let Some(data) = line.strip_prefix("data:") else { continue };
                    let data = data.trim();
                    if data == "[DONE]" {
                        yield ProviderEvent::End;
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(parsed) => {
                            if let Some(usage) = parsed.usage {
                                yield ProviderEvent::UsageMeta {
                                    prompt_tokens: usage.prompt_tokens,
                                    completion_tokens: usage.completion_tokens,
                                };
                            }
                            for choice in parsed.choices {
                                if let Some(content) = choice.delta.content {
                                    if !content.is_empty() {
                                        yield ProviderEvent::Delta { content };
                                    }
                                }
                                if choice.finish_reason.is_some() {
                                    yield ProviderEvent::End;
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            yield ProviderEvent::Error { http_status: None, body: err.to_string() };
                        }
                    }
                }
            }
        }
        yield ProviderEvent::End;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn decode_sse_stream_parses_deltas_and_terminates_on_done() {
        let frames = vec![
            Ok(bytes::Bytes::from(
                "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n",
            )),
            Ok(bytes::Bytes::from(
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            )),
            Ok(bytes::Bytes::from("data: [DONE]\n\n")),
        ];
        let byte_stream = stream::iter(frames);
        let events: Vec<ProviderEvent> = decode_sse_stream(byte_stream).collect().await;
        let mut contents = Vec::new();
        let mut saw_end = false;
        for event in events {
            match event {
                ProviderEvent::Delta { content } => contents.push(content),
                ProviderEvent::End => saw_end = true,
                _ => {}
            }
        }
        assert_eq!(contents.join(""), "hello");
        assert!(saw_end);
    }
}
