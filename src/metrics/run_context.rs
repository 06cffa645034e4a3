// Per-run counters and metric totals
//
// One RunContext is owned by the driver for the whole run and lent to each stage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trends::LossTrend;
use crate::training::oracle::Metrics;

/// Window used for the loss trend shown in progress reports.
const TREND_WINDOW: usize = 20;

/// What the ingestion stages saw.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCounters {
    /// Container files opened
    pub sources: u64,
    /// Data frames decoded (headers excluded)
    pub frames: u64,
    pub datagrams: u64,
    /// Non-empty datagram lines
    pub lines: u64,
    /// Records handed downstream
    pub records: u64,
    /// Lines or payloads dropped for not matching the schema
    pub malformed: u64,
    /// Header lines seen on the datagram channel
    pub markers: u64,
    /// Records removed by sampling
    pub sampled_out: u64,
}

/// Explicit state for one training or scoring run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ingest: IngestCounters,
    /// Batches handed to the oracle
    pub batches: u64,
    /// Records inside those batches
    pub records_processed: u64,
    pub loss_trend: LossTrend,
    metric_totals: BTreeMap<String, f64>,
    metric_batches: u64,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ingest: IngestCounters::default(),
            batches: 0,
            records_processed: 0,
            loss_trend: LossTrend::new(TREND_WINDOW),
            metric_totals: BTreeMap::new(),
            metric_batches: 0,
        }
    }

    pub fn record_batch(&mut self, len: usize) {
        self.batches += 1;
        self.records_processed += len as u64;
    }

    /// Add one batch's metrics to the running totals.
    pub fn accumulate_metrics(&mut self, metrics: &Metrics) {
        for (name, value) in metrics {
            *self.metric_totals.entry(name.clone()).or_insert(0.0) += value;
        }
        self.metric_batches += 1;
    }

    pub fn metric_totals(&self) -> &BTreeMap<String, f64> {
        &self.metric_totals
    }

    /// Per-batch mean of every metric seen so far.
    pub fn metric_means(&self) -> Metrics {
        if self.metric_batches == 0 {
            return Metrics::new();
        }
        self.metric_totals
            .iter()
            .map(|(name, total)| (name.clone(), total / self.metric_batches as f64))
            .collect()
    }

    pub fn log_summary(&self) {
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        tracing::info!(
            run_id = %self.run_id,
            elapsed_secs = elapsed.num_seconds(),
            sources = self.ingest.sources,
            frames = self.ingest.frames,
            datagrams = self.ingest.datagrams,
            records = self.ingest.records,
            malformed = self.ingest.malformed,
            markers = self.ingest.markers,
            sampled_out = self.ingest.sampled_out,
            batches = self.batches,
            records_processed = self.records_processed,
            "Run summary"
        );
        for (name, mean) in self.metric_means() {
            tracing::info!(metric = %name, mean, "Metric");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_means() {
        let mut ctx = RunContext::new();
        assert!(ctx.metric_means().is_empty());

        ctx.accumulate_metrics(&Metrics::from([("accuracy".to_string(), 0.5)]));
        ctx.accumulate_metrics(&Metrics::from([
            ("accuracy".to_string(), 1.0),
            ("loss".to_string(), 0.2),
        ]));

        let means = ctx.metric_means();
        assert!((means["accuracy"] - 0.75).abs() < 1e-9);
        assert!((means["loss"] - 0.1).abs() < 1e-9);
        assert!((ctx.metric_totals()["accuracy"] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_record_batch() {
        let mut ctx = RunContext::new();
        ctx.record_batch(4);
        ctx.record_batch(3);
        assert_eq!(ctx.batches, 2);
        assert_eq!(ctx.records_processed, 7);
    }

    #[test]
    fn test_each_run_gets_its_own_id() {
        assert_ne!(RunContext::new().run_id, RunContext::new().run_id);
    }
}
