// Scoring driver: evaluate a trained model over container files

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::batching::{Batch, BatchWindower, EndOfStream};
use crate::errors::PipelineError;
use crate::ingest::{FileSource, RecordDecoder};
use crate::metrics::RunContext;

use super::oracle::{Metrics, Oracle};

/// Totals for one scoring run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreReport {
    pub batches: u64,
    pub records: u64,
    /// Predicted label counts
    pub labels: BTreeMap<String, u64>,
    /// Per-batch mean of every metric the oracle reported
    pub metrics: Metrics,
}

/// Runs every record through `evaluate` and `predict`, short tail included.
pub struct Scorer<R, O> {
    oracle: O,
    batch_size: usize,
    _record: PhantomData<fn(R)>,
}

impl<R, O> Scorer<R, O>
where
    R: Sync,
    O: Oracle<R>,
{
    pub fn new(oracle: O, batch_size: usize) -> Self {
        Self {
            oracle,
            batch_size,
            _record: PhantomData,
        }
    }

    pub fn into_oracle(self) -> O {
        self.oracle
    }

    pub async fn load(&mut self, checkpoint: &Path) -> Result<()> {
        self.oracle
            .load(checkpoint)
            .await
            .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
        tracing::info!(checkpoint = %checkpoint.display(), "Loaded model for scoring");
        Ok(())
    }

    pub async fn score_files<D>(
        &mut self,
        source: &mut FileSource<D>,
        ctx: &mut RunContext,
    ) -> Result<ScoreReport>
    where
        D: RecordDecoder<Record = R>,
    {
        let mut windower = BatchWindower::new(self.batch_size)?;
        let mut report = ScoreReport::default();

        for group in 0..source.group_count() {
            let records = source.load_group(group, ctx)?;
            for batch in windower.push(records) {
                self.score_batch(&batch, ctx, &mut report).await?;
            }
        }
        if let Some(batch) = windower.finish(EndOfStream::Flush) {
            self.score_batch(&batch, ctx, &mut report).await?;
        }

        report.metrics = ctx.metric_means();
        tracing::info!(
            batches = report.batches,
            records = report.records,
            "Scoring finished"
        );
        Ok(report)
    }

    pub async fn score_batch(
        &mut self,
        batch: &Batch<R>,
        ctx: &mut RunContext,
        report: &mut ScoreReport,
    ) -> Result<()> {
        let metrics = self.oracle.evaluate(&batch.records).await?;
        let predictions = self.oracle.predict(&batch.records).await?;
        if predictions.len() != batch.len() {
            return Err(PipelineError::oracle(
                "predict",
                format!(
                    "returned {} predictions for {} records",
                    predictions.len(),
                    batch.len()
                ),
            )
            .into());
        }

        for prediction in predictions {
            *report.labels.entry(prediction.label).or_insert(0) += 1;
        }
        ctx.record_batch(batch.len());
        ctx.accumulate_metrics(&metrics);
        report.batches += 1;
        report.records += batch.len() as u64;

        tracing::info!(
            batch_start = batch.range.start,
            batch_end = batch.range.end,
            metrics = ?metrics,
            "Scored batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineResult;
    use crate::ingest::{ContainerWriter, RawDecoder};
    use crate::training::oracle::{FitReport, Prediction};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Labels each record by its first byte and reports a fixed accuracy.
    struct EchoOracle {
        short_predictions: bool,
    }

    #[async_trait]
    impl Oracle<Vec<u8>> for EchoOracle {
        async fn fit(&mut self, _batch: &[Vec<u8>]) -> PipelineResult<FitReport> {
            Ok(FitReport::default())
        }

        async fn predict(&mut self, batch: &[Vec<u8>]) -> PipelineResult<Vec<Prediction>> {
            let take = if self.short_predictions { batch.len() - 1 } else { batch.len() };
            Ok(batch[..take]
                .iter()
                .map(|r| Prediction {
                    label: String::from_utf8_lossy(&r[..1]).into_owned(),
                    score: 1.0,
                })
                .collect())
        }

        async fn evaluate(&mut self, batch: &[Vec<u8>]) -> PipelineResult<Metrics> {
            Ok(Metrics::from([
                ("accuracy".to_string(), 0.9),
                ("size".to_string(), batch.len() as f64),
            ]))
        }

        async fn save(&mut self, _path: &Path) -> PipelineResult<()> {
            Ok(())
        }

        async fn load(&mut self, _path: &Path) -> PipelineResult<()> {
            Ok(())
        }
    }

    fn source(dir: &TempDir, records: &[&[u8]]) -> FileSource<RawDecoder> {
        let path = dir.path().join("score.ncap");
        let mut writer = ContainerWriter::create(&path, b"header").unwrap();
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.finish().unwrap();
        FileSource::new(vec![path], RawDecoder)
    }

    #[tokio::test]
    async fn test_scoring_flushes_the_tail() {
        let dir = TempDir::new().unwrap();
        let mut source = source(&dir, &[b"a1", b"a2", b"b1", b"a3", b"b2"]);
        let mut scorer = Scorer::new(EchoOracle { short_predictions: false }, 2);
        let mut ctx = RunContext::new();

        let report = scorer.score_files(&mut source, &mut ctx).await.unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.records, 5);
        assert_eq!(report.labels["a"], 3);
        assert_eq!(report.labels["b"], 2);
        assert!((report.metrics["accuracy"] - 0.9).abs() < 1e-9);
        assert!((report.metrics["size"] - 5.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_prediction_count_mismatch_is_oracle_failure() {
        let dir = TempDir::new().unwrap();
        let mut source = source(&dir, &[b"a1", b"a2"]);
        let mut scorer = Scorer::new(EchoOracle { short_predictions: true }, 2);

        let err = scorer
            .score_files(&mut source, &mut RunContext::new())
            .await
            .unwrap_err();
        assert!(crate::training::controller::is_oracle_failure(&err));
    }
}
