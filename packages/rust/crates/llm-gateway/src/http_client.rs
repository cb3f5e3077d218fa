//! Single process-wide HTTP/2 client with pooled connections (§4.4).
//!
//! Built once at startup and shared by every provider adapter. SSE calls disable
//! response compression (`Accept-Encoding: identity`) so intermediaries cannot buffer
//! a gzip frame before the client sees the first byte.

use std::time::Duration;

/// Minimum keep-alive connections per host (§4.4).
pub const MIN_POOL_PER_HOST: usize = 50;
/// Idle connection timeout (§4.4).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Build the process-wide client. Call once; clone the returned handle everywhere
/// else — `reqwest::Client` is internally `Arc`-backed and cheap to clone.
pub fn build_shared_client(overall_timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(MIN_POOL_PER_HOST)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .timeout(overall_timeout)
        .build()?;
    Ok(client)
}

/// Fire one tiny request per provider to pre-establish pooled connections, reducing
/// cold-start TTFT by 200-500ms (§4.4). Failures are logged and otherwise ignored —
/// warmup is an optimization, not a precondition for serving traffic.
pub async fn warmup(client: &reqwest::Client, provider_base_urls: &[(String, String)]) {
    for (provider, base_url) in provider_base_urls {
        let start = std::time::Instant::now();
        match client.head(base_url).send().await {
            Ok(_) => {
                tracing::info!(
                    event = "http_client.warmup",
                    provider = provider.as_str(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "warmup request completed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    event = "http_client.warmup_failed",
                    provider = provider.as_str(),
                    error = %err,
                    "warmup request failed, continuing without pre-warmed connection"
                );
            }
        }
    }
}
