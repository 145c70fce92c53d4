//! Per-provider operation metrics
//!
//! Keeps a bounded FIFO history of dispatch records per provider and derives
//! rolling latency percentiles and error rates on read, so selection always
//! ranks on current data.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;
use voice_provider::{OperationKind, ProviderError, ProviderId};

use crate::error::ConfigError;

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Records kept per provider (default: 100)
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Ignore and prune records older than this (keep all when unset)
    #[serde(default)]
    pub retention_ms: Option<u64>,

    /// Export the snapshot to the metrics sink this often (off when unset)
    #[serde(default)]
    pub export_interval_ms: Option<u64>,
}

const fn default_history_size() -> usize {
    100
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            retention_ms: None,
            export_interval_ms: None,
        }
    }
}

impl MetricsConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_size == 0 {
            return Err(ConfigError::invalid(
                "metrics.history_size",
                "must be greater than 0",
            ));
        }
        if self.retention_ms == Some(0) {
            return Err(ConfigError::invalid(
                "metrics.retention_ms",
                "must be greater than 0 when set",
            ));
        }
        if self.export_interval_ms == Some(0) {
            return Err(ConfigError::invalid(
                "metrics.export_interval_ms",
                "must be greater than 0 when set",
            ));
        }
        Ok(())
    }
}

/// One dispatch outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationMetricsRecord {
    /// Provider that served the dispatch
    pub provider_id: ProviderId,
    /// Operation kind
    pub operation: OperationKind,
    /// When the dispatch finished
    pub timestamp: DateTime<Utc>,
    /// Dispatch latency (time to first chunk for streams)
    pub latency_ms: u64,
    /// Whether it succeeded
    pub success: bool,
    /// Stable error code on failure
    pub error_kind: Option<String>,
}

/// Rolling statistics for one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    /// Provider the summary describes
    pub provider_id: ProviderId,
    /// Records inside the window
    pub sample_count: usize,
    /// Successful records inside the window
    pub success_count: usize,
    /// Failures divided by all records (0.0 without samples)
    pub error_rate: f64,
    /// Median latency of successful records
    pub p50_latency_ms: Option<u64>,
    /// 95th percentile latency of successful records
    pub p95_latency_ms: Option<u64>,
}

/// Summaries of every provider at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken
    pub generated_at: DateTime<Utc>,
    /// One summary per provider, ordered by id
    pub providers: Vec<MetricsSummary>,
}

#[derive(Debug, Clone)]
struct Sample {
    record: OperationMetricsRecord,
    at: Instant,
}

/// Bounded metrics store for all providers
#[derive(Debug)]
pub struct MetricsAggregator {
    config: MetricsConfig,
    history: RwLock<HashMap<ProviderId, VecDeque<Sample>>>,
}

impl MetricsAggregator {
    /// Create an empty aggregator
    #[must_use]
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Append a record, evicting the oldest beyond `history_size`
    pub fn record(&self, record: OperationMetricsRecord) {
        let now = Instant::now();
        let mut history = self.history.write();
        let buffer = history.entry(record.provider_id.clone()).or_default();
        buffer.push_back(Sample { record, at: now });
        while buffer.len() > self.config.history_size {
            buffer.pop_front();
        }
        self.prune(buffer, now);
    }

    /// Record a successful dispatch
    pub fn record_success(&self, provider_id: &ProviderId, operation: OperationKind, latency: Duration) {
        self.record(OperationMetricsRecord {
            provider_id: provider_id.clone(),
            operation,
            timestamp: Utc::now(),
            latency_ms: duration_ms(latency),
            success: true,
            error_kind: None,
        });
    }

    /// Record a failed dispatch
    pub fn record_failure(
        &self,
        provider_id: &ProviderId,
        operation: OperationKind,
        latency: Duration,
        error: &ProviderError,
    ) {
        self.record(OperationMetricsRecord {
            provider_id: provider_id.clone(),
            operation,
            timestamp: Utc::now(),
            latency_ms: duration_ms(latency),
            success: false,
            error_kind: Some(error.code()),
        });
    }

    fn prune(&self, buffer: &mut VecDeque<Sample>, now: Instant) {
        if let Some(retention) = self.config.retention_ms.map(Duration::from_millis) {
            while buffer
                .front()
                .is_some_and(|s| now.saturating_duration_since(s.at) > retention)
            {
                buffer.pop_front();
            }
        }
    }

    /// Records currently inside the window, oldest first
    #[must_use]
    pub fn records(&self, provider_id: &ProviderId) -> Vec<OperationMetricsRecord> {
        let now = Instant::now();
        let mut history = self.history.write();
        history.get_mut(provider_id).map_or_else(Vec::new, |buffer| {
            self.prune(buffer, now);
            buffer.iter().map(|s| s.record.clone()).collect()
        })
    }

    /// Rolling statistics for one provider
    #[must_use]
    pub fn summary(&self, provider_id: &ProviderId) -> MetricsSummary {
        let records = self.records(provider_id);
        summarize(provider_id.clone(), &records)
    }

    /// Rolling statistics for one provider, restricted to one operation kind
    #[must_use]
    pub fn operation_summary(&self, provider_id: &ProviderId, operation: OperationKind) -> MetricsSummary {
        let records: Vec<OperationMetricsRecord> = self
            .records(provider_id)
            .into_iter()
            .filter(|r| r.operation == operation)
            .collect();
        summarize(provider_id.clone(), &records)
    }

    /// Rolling median latency of one operation kind, if it has a successful record
    #[must_use]
    pub fn p50_latency_ms(&self, provider_id: &ProviderId, operation: OperationKind) -> Option<u64> {
        self.operation_summary(provider_id, operation).p50_latency_ms
    }

    /// Summaries of every provider with history
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut ids: Vec<ProviderId> = self.history.read().keys().cloned().collect();
        ids.sort();
        MetricsSnapshot {
            generated_at: Utc::now(),
            providers: ids.iter().map(|id| self.summary(id)).collect(),
        }
    }

    /// Forget a provider's history
    pub fn remove(&self, provider_id: &ProviderId) {
        self.history.write().remove(provider_id);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[allow(clippy::cast_precision_loss)]
fn summarize(provider_id: ProviderId, records: &[OperationMetricsRecord]) -> MetricsSummary {
    let mut latencies: Vec<u64> = records
        .iter()
        .filter(|r| r.success)
        .map(|r| r.latency_ms)
        .collect();
    latencies.sort_unstable();

    let success_count = latencies.len();
    let error_rate = if records.is_empty() {
        0.0
    } else {
        (records.len() - success_count) as f64 / records.len() as f64
    };

    MetricsSummary {
        provider_id,
        sample_count: records.len(),
        success_count,
        error_rate,
        p50_latency_ms: percentile(&latencies, 50),
        p95_latency_ms: percentile(&latencies, 95),
    }
}

/// Nearest-rank percentile of an ascending slice
fn percentile(sorted: &[u64], pct: usize) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted.get(rank - 1).copied()
}

/// Export failure
#[derive(Debug, Error)]
pub enum ExportError {
    /// The sink could not accept the snapshot
    #[error("Metrics export failed: {0}")]
    Sink(String),
}

/// Destination for periodic metrics snapshots
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Export one snapshot
    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), ExportError>;
}

/// Sink that writes each summary as a structured log line
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), ExportError> {
        for summary in &snapshot.providers {
            info!(
                provider = %summary.provider_id,
                samples = summary.sample_count,
                error_rate = summary.error_rate,
                p50_ms = summary.p50_latency_ms,
                p95_ms = summary.p95_latency_ms,
                "Provider metrics"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ProviderId {
        ProviderId::parse(s).unwrap()
    }

    fn aggregator(history_size: usize) -> MetricsAggregator {
        MetricsAggregator::new(MetricsConfig {
            history_size,
            ..Default::default()
        })
    }

    #[test]
    fn percentile_nearest_rank() {
        let values: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&values, 50), Some(50));
        assert_eq!(percentile(&values, 95), Some(95));
        assert_eq!(percentile(&[7], 95), Some(7));
        assert_eq!(percentile(&[], 50), None);
        assert_eq!(percentile(&[10, 20, 30, 40], 50), Some(20));
    }

    #[tokio::test]
    async fn evicts_oldest_beyond_history_size() {
        let metrics = aggregator(3);
        let a = id("a");
        for ms in [10, 20, 30, 40, 50] {
            metrics.record_success(&a, OperationKind::Tts, Duration::from_millis(ms));
        }
        let latencies: Vec<u64> = metrics.records(&a).iter().map(|r| r.latency_ms).collect();
        assert_eq!(latencies, [30, 40, 50]);
    }

    #[tokio::test]
    async fn percentiles_use_successful_samples_only() {
        let metrics = aggregator(100);
        let a = id("a");
        metrics.record_success(&a, OperationKind::Stt, Duration::from_millis(100));
        metrics.record_success(&a, OperationKind::Stt, Duration::from_millis(300));
        metrics.record_failure(
            &a,
            OperationKind::Stt,
            Duration::from_millis(5_000),
            &ProviderError::Timeout(5_000),
        );

        let summary = metrics.summary(&a);
        assert_eq!(summary.sample_count, 3);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.p50_latency_ms, Some(100));
        assert_eq!(summary.p95_latency_ms, Some(300));
        assert!((summary.error_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn operation_summary_keeps_kinds_apart() {
        let metrics = aggregator(100);
        let azure = id("azure");
        metrics.record_success(&azure, OperationKind::Tts, Duration::from_millis(40));
        metrics.record_success(&azure, OperationKind::Tts, Duration::from_millis(60));
        metrics.record_success(&azure, OperationKind::Stt, Duration::from_millis(900));

        assert_eq!(metrics.p50_latency_ms(&azure, OperationKind::Stt), Some(900));
        assert_eq!(metrics.p50_latency_ms(&azure, OperationKind::Tts), Some(40));
        assert_eq!(metrics.operation_summary(&azure, OperationKind::Stt).sample_count, 1);
        assert_eq!(metrics.summary(&azure).sample_count, 3);
    }

    #[tokio::test]
    async fn failures_carry_error_code() {
        let metrics = aggregator(10);
        let a = id("a");
        metrics.record_failure(
            &a,
            OperationKind::Tts,
            Duration::from_millis(3),
            &ProviderError::from_http_status(502, "bad gateway"),
        );
        let records = metrics.records(&a);
        assert_eq!(records[0].error_kind.as_deref(), Some("HTTP_502"));
        assert!(!records[0].success);
    }

    #[tokio::test]
    async fn empty_summary() {
        let metrics = aggregator(10);
        let summary = metrics.summary(&id("nobody"));
        assert_eq!(summary.sample_count, 0);
        assert!(summary.error_rate.abs() < f64::EPSILON);
        assert_eq!(summary.p50_latency_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn retention_prunes_old_records() {
        let metrics = MetricsAggregator::new(MetricsConfig {
            retention_ms: Some(1_000),
            ..Default::default()
        });
        let a = id("a");
        metrics.record_success(&a, OperationKind::Tts, Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(600)).await;
        metrics.record_success(&a, OperationKind::Tts, Duration::from_millis(20));
        tokio::time::advance(Duration::from_millis(600)).await;

        let records = metrics.records(&a);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].latency_ms, 20);
    }

    #[tokio::test]
    async fn snapshot_is_ordered_by_provider() {
        let metrics = aggregator(10);
        for name in ["whisper", "azure", "piper"] {
            metrics.record_success(&id(name), OperationKind::Stt, Duration::from_millis(1));
        }
        let names: Vec<String> = metrics
            .snapshot()
            .providers
            .iter()
            .map(|s| s.provider_id.to_string())
            .collect();
        assert_eq!(names, ["azure", "piper", "whisper"]);
    }

    #[tokio::test]
    async fn tracing_sink_accepts_snapshot() {
        let metrics = aggregator(10);
        metrics.record_success(&id("a"), OperationKind::Stt, Duration::from_millis(1));
        assert!(TracingMetricsSink.export(&metrics.snapshot()).await.is_ok());
    }
}
