//! Rolling window of the last N request records with percentile aggregates (§4.8).

use std::collections::VecDeque;
use std::sync::Mutex;

/// Default rolling window size (§6.4 `metrics.window_size`).
pub const DEFAULT_WINDOW_SIZE: usize = 1000;

/// Which side of the leader/follower split a completed request took (§3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceRole {
    /// This request ran `leader_fn` itself.
    Leader,
    /// This request awaited another caller's result.
    Follower,
}

/// One completed request's timing and outcome (§4.8).
#[derive(Debug, Clone)]
pub struct RequestRecord {
    /// Time to first upstream byte, ms.
    pub ttft_ms: u64,
    /// Total request wall time, ms.
    pub total_ms: u64,
    /// Time spent waiting in the pacer, ms.
    pub queue_wait_ms: u64,
    /// Provider selected for this request.
    pub provider: String,
    /// Model selected for this request.
    pub model: String,
    /// `"ok"` or an error taxonomy kind.
    pub status: &'static str,
    /// Error taxonomy kind, when `status != "ok"`.
    pub error_kind: Option<&'static str>,
    /// Leader or follower.
    pub coalesce_role: CoalesceRole,
    /// Number of retries the leader performed for this request.
    pub retries: u32,
}

/// Percentile/count aggregate over a single metric column.
#[derive(Debug, Clone, Copy, Default)]
pub struct Percentiles {
    /// 50th percentile.
    pub p50: u64,
    /// 95th percentile.
    pub p95: u64,
    /// 99th percentile.
    pub p99: u64,
    /// Minimum observed value.
    pub min: u64,
    /// Maximum observed value.
    pub max: u64,
    /// Number of samples.
    pub count: usize,
}

fn percentiles(values: &mut [u64]) -> Percentiles {
    if values.is_empty() {
        return Percentiles::default();
    }
    values.sort_unstable();
    let at = |p: f64| -> u64 {
        let idx = ((values.len() - 1) as f64 * p).round() as usize;
        values[idx.min(values.len() - 1)]
    };
    Percentiles {
        p50: at(0.50),
        p95: at(0.95),
        p99: at(0.99),
        min: values[0],
        max: values[values.len() - 1],
        count: values.len(),
    }
}

/// A snapshot of the rolling metrics window, ready to expose on a `/metrics` endpoint.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Time-to-first-token distribution.
    pub ttft_ms: Percentiles,
    /// Total request duration distribution.
    pub total_ms: Percentiles,
    /// Pacer queue-wait distribution.
    pub queue_wait_ms: Percentiles,
    /// Fraction of requests in the window that errored.
    pub error_rate: f64,
    /// Count of requests that ran as coalescer leader in the window.
    pub coalesce_leaders: u64,
    /// Count of requests that ran as coalescer follower in the window.
    pub coalesce_followers: u64,
}

/// Thread-safe rolling window of the last `window_size` request records.
pub struct MetricsRegistry {
    records: Mutex<VecDeque<RequestRecord>>,
    window_size: usize,
}

impl MetricsRegistry {
    /// Build a registry with the default window size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window_size(DEFAULT_WINDOW_SIZE)
    }

    /// Build a registry with an explicit window size.
    #[must_use]
    pub fn with_window_size(window_size: usize) -> Self {
        Self { records: Mutex::new(VecDeque::with_capacity(window_size)), window_size: window_size.max(1) }
    }

    /// Record a completed request, evicting the oldest record if the window is full.
    pub fn record(&self, record: RequestRecord) {
        let Ok(mut records) = self.records.lock() else { return };
        if records.len() >= self.window_size {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Compute the current aggregate snapshot over the window.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let Ok(records) = self.records.lock() else { return MetricsSnapshot::default() };
        if records.is_empty() {
            return MetricsSnapshot::default();
        }
        let mut ttft: Vec<u64> = records.iter().map(|r| r.ttft_ms).collect();
        let mut total: Vec<u64> = records.iter().map(|r| r.total_ms).collect();
        let mut queue: Vec<u64> = records.iter().map(|r| r.queue_wait_ms).collect();
        let errors = records.iter().filter(|r| r.status != "ok").count();
        let leaders = records.iter().filter(|r| r.coalesce_role == CoalesceRole::Leader).count() as u64;
        let followers = records.iter().filter(|r| r.coalesce_role == CoalesceRole::Follower).count() as u64;

        MetricsSnapshot {
            ttft_ms: percentiles(&mut ttft),
            total_ms: percentiles(&mut total),
            queue_wait_ms: percentiles(&mut queue),
            error_rate: errors as f64 / records.len() as f64,
            coalesce_leaders: leaders,
            coalesce_followers: followers,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
