// Training loop with manual early stopping
//
// Data arrives in irregular pieces, so the model framework's own stopping logic is
// of no use. The controller fits one batch at a time and decides after every batch
// whether to keep going.

use std::marker::PhantomData;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::batching::{Batch, BatchWindower, EndOfStream};
use crate::errors::PipelineError;
use crate::ingest::{DatagramSource, FieldRecord, FileSource, RecordDecoder, Sampler, SocketEvent, SocketRecordAssembler};
use crate::metrics::RunContext;

use super::checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
use super::oracle::Oracle;

/// Where a run is in its life. Everything but `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Running,
    EarlyStopped,
    Completed,
    Failed,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        self != Lifecycle::Running
    }
}

/// Loop settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Records per batch
    pub batch_size: usize,
    /// Passes over the input files (file mode)
    pub epochs: u64,
    /// Epochs before the early-stop check is armed
    pub patience: u64,
    /// Validation loss below which training stops once armed
    pub min_delta: f64,
    /// Save a checkpoint after every completed epoch (file mode)
    pub checkpoint_every_epoch: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            batch_size: 256_000,
            epochs: 2500,
            patience: 3,
            min_delta: 0.001,
            checkpoint_every_epoch: true,
        }
    }
}

/// Owned exclusively by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub epoch: u64,
    pub loss: Option<f64>,
    pub val_loss: Option<f64>,
    /// Batches checked against `min_delta` since patience ran out
    pub patience_checks: u64,
    pub lifecycle: Lifecycle,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            loss: None,
            val_loss: None,
            patience_checks: 0,
            lifecycle: Lifecycle::Running,
        }
    }
}

/// Drives batches through an oracle and owns the stopping decision.
pub struct TrainingLoopController<R, O> {
    oracle: O,
    checkpoints: CheckpointManager,
    config: ControllerConfig,
    state: TrainingState,
    /// File range of the group being trained, for checkpoint names
    files: (u64, u64),
    _record: PhantomData<fn(R)>,
}

impl<R, O> TrainingLoopController<R, O>
where
    R: Sync,
    O: Oracle<R>,
{
    pub fn new(oracle: O, checkpoints: CheckpointManager, config: ControllerConfig) -> Self {
        Self {
            oracle,
            checkpoints: checkpoints.with_epoch_count(config.epochs),
            config,
            state: TrainingState::default(),
            files: (0, 0),
            _record: PhantomData,
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn into_oracle(self) -> O {
        self.oracle
    }

    /// Load the latest checkpoint into the oracle and continue after it.
    ///
    /// A checkpoint saved mid-epoch resumes that epoch; an end-of-epoch one resumes
    /// the next.
    pub async fn resume(&mut self) -> Result<Option<Checkpoint>> {
        let Some(checkpoint) = self.checkpoints.latest()? else {
            tracing::info!(dir = %self.checkpoints.dir().display(), "No checkpoint to resume from");
            return Ok(None);
        };

        if let Err(e) = self.oracle.load(&checkpoint.path).await {
            self.state.lifecycle = Lifecycle::Failed;
            return Err(e).with_context(|| format!("Failed to resume from {}", checkpoint.name));
        }

        self.state.epoch = match checkpoint.name.batch {
            Some(_) => checkpoint.name.epoch,
            None => checkpoint.name.epoch + 1,
        };
        if let Some(metadata) = &checkpoint.metadata {
            self.state.loss = metadata.loss;
            self.state.val_loss = metadata.val_loss;
        }

        tracing::info!(
            checkpoint = %checkpoint.name,
            epoch = self.state.epoch,
            "Resumed from checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Fit one batch and apply the stopping rule.
    ///
    /// Once armed (`epoch >= patience`), a validation loss below `min_delta` saves
    /// exactly one checkpoint and moves to `EarlyStopped`.
    pub async fn step(&mut self, batch: &Batch<R>, ctx: &mut RunContext) -> Result<Lifecycle> {
        if self.state.lifecycle.is_terminal() {
            return Ok(self.state.lifecycle);
        }

        let report = match self.oracle.fit(&batch.records).await {
            Ok(report) => report,
            Err(e) => {
                self.state.lifecycle = Lifecycle::Failed;
                tracing::error!(
                    epoch = self.state.epoch,
                    batch_start = batch.range.start,
                    batch_end = batch.range.end,
                    error = %e,
                    "Oracle failed, aborting run"
                );
                return Err(e).context("Training aborted");
            }
        };

        self.state.loss = Some(report.loss);
        self.state.val_loss = Some(report.val_loss);
        ctx.record_batch(batch.len());
        ctx.loss_trend.push(report.val_loss);
        ctx.accumulate_metrics(&report.metrics);

        tracing::info!(
            epoch = self.state.epoch,
            epochs = self.config.epochs,
            batch_start = batch.range.start,
            batch_end = batch.range.end,
            loss = report.loss,
            val_loss = report.val_loss,
            trend = %ctx.loss_trend.trend(),
            "Fitted batch"
        );

        if self.state.epoch >= self.config.patience {
            self.state.patience_checks += 1;
            tracing::debug!(
                val_loss = report.val_loss,
                min_delta = self.config.min_delta,
                "Checking early stop"
            );

            if report.val_loss < self.config.min_delta {
                tracing::info!(
                    epoch = self.state.epoch,
                    val_loss = report.val_loss,
                    min_delta = self.config.min_delta,
                    "Stopping early"
                );
                self.state.lifecycle = Lifecycle::EarlyStopped;
                let range = (batch.range.start, batch.range.end);
                self.save_checkpoint(Some(range), ctx).await?;
            }
        }

        Ok(self.state.lifecycle)
    }

    /// Fit batches in order until one of them ends the run.
    pub async fn run_batches(
        &mut self,
        batches: Vec<Batch<R>>,
        ctx: &mut RunContext,
    ) -> Result<Lifecycle> {
        for batch in batches {
            if self.step(&batch, ctx).await?.is_terminal() {
                break;
            }
        }
        Ok(self.state.lifecycle)
    }

    /// Train over container files for the configured number of epochs.
    ///
    /// The leftover is carried across file groups within an epoch and dropped when
    /// the epoch ends.
    pub async fn run_files<D>(
        &mut self,
        source: &mut FileSource<D>,
        ctx: &mut RunContext,
    ) -> Result<Lifecycle>
    where
        D: RecordDecoder<Record = R>,
    {
        let result = self.train_files(source, ctx).await;
        self.settle(result)
    }

    async fn train_files<D>(
        &mut self,
        source: &mut FileSource<D>,
        ctx: &mut RunContext,
    ) -> Result<Lifecycle>
    where
        D: RecordDecoder<Record = R>,
    {
        let mut windower = BatchWindower::new(self.config.batch_size)?;

        if self.state.epoch >= self.config.epochs {
            tracing::info!(
                epoch = self.state.epoch,
                epochs = self.config.epochs,
                "All epochs already trained"
            );
            self.state.lifecycle = Lifecycle::Completed;
            return Ok(self.state.lifecycle);
        }

        loop {
            tracing::info!(
                epoch = self.state.epoch,
                epochs = self.config.epochs,
                files = source.files().len(),
                "Starting epoch"
            );

            for group in 0..source.group_count() {
                self.files = source.group_range(group);
                let records = source.load_group(group, ctx)?;
                let batches = windower.push(records);
                if self.run_batches(batches, ctx).await?.is_terminal() {
                    return Ok(self.state.lifecycle);
                }
            }

            windower.finish(EndOfStream::Discard);
            self.files = (0, source.file_batch_size() as u64);

            // The last epoch's checkpoint is the final one.
            if self.state.epoch + 1 >= self.config.epochs {
                return self.complete(ctx).await;
            }
            if self.config.checkpoint_every_epoch {
                self.save_checkpoint(None, ctx).await?;
            }
            self.state.epoch += 1;
        }
    }

    async fn complete(&mut self, ctx: &mut RunContext) -> Result<Lifecycle> {
        self.state.lifecycle = Lifecycle::Completed;
        self.save_checkpoint(None, ctx).await?;
        tracing::info!(
            epoch = self.state.epoch,
            val_loss = ?self.state.val_loss,
            "Training completed"
        );
        Ok(self.state.lifecycle)
    }

    async fn save_checkpoint(
        &mut self,
        batch: Option<(u64, u64)>,
        ctx: &RunContext,
    ) -> Result<Checkpoint> {
        let name = self.checkpoints.name(self.state.epoch, self.files, batch);
        let metadata = CheckpointMetadata {
            run_id: ctx.run_id,
            created_at: Utc::now(),
            epoch: self.state.epoch,
            files: self.files,
            batch,
            loss: self.state.loss,
            val_loss: self.state.val_loss,
            lifecycle: self.state.lifecycle,
            records_processed: ctx.records_processed,
        };
        self.checkpoints
            .save::<R, O>(&mut self.oracle, name, metadata)
            .await
    }

    /// Any error leaving a run marks it failed.
    fn settle(&mut self, result: Result<Lifecycle>) -> Result<Lifecycle> {
        if result.is_err() {
            self.state.lifecycle = Lifecycle::Failed;
        }
        result
    }
}

impl<O> TrainingLoopController<FieldRecord, O>
where
    O: Oracle<FieldRecord>,
{
    /// Train on records streamed over the datagram channel until the source ends
    /// or the run stops early. Header markers advance the epoch.
    pub async fn run_socket<S>(
        &mut self,
        source: &mut S,
        assembler: &mut SocketRecordAssembler,
        mut sampler: Option<Sampler>,
        ctx: &mut RunContext,
    ) -> Result<Lifecycle>
    where
        S: DatagramSource + ?Sized,
    {
        let result = self.train_socket(source, assembler, &mut sampler, ctx).await;
        self.settle(result)
    }

    async fn train_socket<S>(
        &mut self,
        source: &mut S,
        assembler: &mut SocketRecordAssembler,
        sampler: &mut Option<Sampler>,
        ctx: &mut RunContext,
    ) -> Result<Lifecycle>
    where
        S: DatagramSource + ?Sized,
    {
        let mut windower = BatchWindower::new(self.config.batch_size)?;
        self.files = (0, 0);

        while let Some(datagram) = source
            .next_datagram()
            .await
            .context("Failed to receive datagram")?
        {
            for event in assembler.push_datagram(&datagram, &mut ctx.ingest) {
                let records = match event {
                    SocketEvent::EpochMarker => {
                        self.state.epoch += 1;
                        continue;
                    }
                    SocketEvent::Records(records) => records,
                };

                let records = match sampler.as_mut() {
                    Some(sampler) => {
                        let before = records.len();
                        let kept = sampler.sample(records);
                        ctx.ingest.sampled_out += (before - kept.len()) as u64;
                        kept
                    }
                    None => records,
                };

                let batches = windower.push(records);
                if self.run_batches(batches, ctx).await?.is_terminal() {
                    return Ok(self.state.lifecycle);
                }
            }
        }

        let unbatched = assembler.take_pending().len() + windower.leftover().len();
        windower.finish(EndOfStream::Discard);
        tracing::info!(unbatched, "Datagram source ended");

        self.complete(ctx).await
    }
}

/// True when the error chain carries an oracle failure.
pub fn is_oracle_failure(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|e| e.downcast_ref::<PipelineError>())
        .any(|e| matches!(e, PipelineError::OracleFailure { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineResult;
    use crate::ingest::LineParser;
    use crate::ingest::ReplaySource;
    use crate::training::oracle::{FitReport, Metrics, Prediction};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Replays scripted validation losses; `None` entries fail the fit.
    #[derive(Default)]
    struct ScriptedOracle {
        val_losses: VecDeque<Option<f64>>,
        fitted: Vec<usize>,
        saved: Vec<PathBuf>,
        loaded: Vec<PathBuf>,
    }

    impl ScriptedOracle {
        fn new(val_losses: impl IntoIterator<Item = Option<f64>>) -> Self {
            Self {
                val_losses: val_losses.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl<R: Sync> Oracle<R> for ScriptedOracle {
        async fn fit(&mut self, batch: &[R]) -> PipelineResult<FitReport> {
            match self.val_losses.pop_front().unwrap_or(Some(1.0)) {
                Some(val_loss) => {
                    self.fitted.push(batch.len());
                    Ok(FitReport {
                        loss: val_loss * 2.0,
                        val_loss,
                        metrics: Metrics::new(),
                    })
                }
                None => Err(PipelineError::oracle("fit", "model diverged")),
            }
        }

        async fn predict(&mut self, batch: &[R]) -> PipelineResult<Vec<Prediction>> {
            Ok(vec![
                Prediction {
                    label: "normal".into(),
                    score: 1.0
                };
                batch.len()
            ])
        }

        async fn evaluate(&mut self, _batch: &[R]) -> PipelineResult<Metrics> {
            Ok(Metrics::new())
        }

        async fn save(&mut self, path: &Path) -> PipelineResult<()> {
            std::fs::write(path, b"weights")?;
            self.saved.push(path.to_path_buf());
            Ok(())
        }

        async fn load(&mut self, path: &Path) -> PipelineResult<()> {
            self.loaded.push(path.to_path_buf());
            Ok(())
        }
    }

    fn controller(
        dir: &TempDir,
        oracle: ScriptedOracle,
        patience: u64,
    ) -> TrainingLoopController<u32, ScriptedOracle> {
        let checkpoints = CheckpointManager::new(dir.path(), "dnn", "h5").unwrap();
        let config = ControllerConfig {
            batch_size: 2,
            epochs: 5,
            patience,
            min_delta: 0.1,
            checkpoint_every_epoch: true,
        };
        TrainingLoopController::new(oracle, checkpoints, config)
    }

    fn batch(start: u64) -> Batch<u32> {
        Batch {
            records: vec![start as u32, start as u32 + 1],
            range: start..start + 2,
        }
    }

    #[tokio::test]
    async fn test_early_stop_fires_at_patience() {
        let dir = TempDir::new().unwrap();
        let mut controller = controller(&dir, ScriptedOracle::new([Some(0.05), Some(0.01)]), 2);
        controller.state.epoch = 2;
        let mut ctx = RunContext::new();

        let lifecycle = controller.step(&batch(0), &mut ctx).await.unwrap();
        assert_eq!(lifecycle, Lifecycle::EarlyStopped);
        assert_eq!(controller.oracle().saved.len(), 1);
        assert_eq!(
            controller.oracle().saved[0],
            dir.path().join("dnn-epoch-002-files-000000-000000-batch-000000000000-000000000002.h5")
        );

        // halted: nothing else is fitted or saved
        let lifecycle = controller.step(&batch(2), &mut ctx).await.unwrap();
        assert_eq!(lifecycle, Lifecycle::EarlyStopped);
        assert_eq!(controller.oracle().fitted.len(), 1);
        assert_eq!(controller.oracle().saved.len(), 1);
    }

    #[tokio::test]
    async fn test_no_early_stop_before_patience() {
        let dir = TempDir::new().unwrap();
        let mut controller = controller(&dir, ScriptedOracle::new([Some(0.0), Some(0.0)]), 2);
        controller.state.epoch = 1;
        let mut ctx = RunContext::new();

        let lifecycle = controller.run_batches(vec![batch(0), batch(2)], &mut ctx).await.unwrap();
        assert_eq!(lifecycle, Lifecycle::Running);
        assert_eq!(controller.state().patience_checks, 0);
        assert!(controller.oracle().saved.is_empty());
        assert_eq!(controller.state().val_loss, Some(0.0));
    }

    #[tokio::test]
    async fn test_loss_at_min_delta_keeps_running() {
        let dir = TempDir::new().unwrap();
        let mut controller = controller(&dir, ScriptedOracle::new([Some(0.1)]), 0);
        let mut ctx = RunContext::new();

        let lifecycle = controller.step(&batch(0), &mut ctx).await.unwrap();
        assert_eq!(lifecycle, Lifecycle::Running);
        assert_eq!(controller.state().patience_checks, 1);
    }

    #[tokio::test]
    async fn test_oracle_error_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let mut controller = controller(&dir, ScriptedOracle::new([Some(0.5), None, Some(0.5)]), 10);
        let mut ctx = RunContext::new();

        let err = controller
            .run_batches(vec![batch(0), batch(2), batch(4)], &mut ctx)
            .await
            .unwrap_err();

        assert!(is_oracle_failure(&err));
        assert_eq!(controller.state().lifecycle, Lifecycle::Failed);
        assert_eq!(controller.oracle().fitted, vec![2]);
        assert!(controller.oracle().saved.is_empty());
    }

    #[tokio::test]
    async fn test_socket_run_follows_markers_and_completes() {
        let dir = TempDir::new().unwrap();
        let checkpoints = CheckpointManager::new(dir.path(), "dnn", "h5").unwrap();
        let config = ControllerConfig {
            batch_size: 2,
            epochs: 1,
            patience: 1,
            min_delta: 0.01,
            checkpoint_every_epoch: false,
        };
        let oracle = ScriptedOracle::new([Some(0.5), Some(0.5), Some(0.5)]);
        let mut controller: TrainingLoopController<FieldRecord, _> =
            TrainingLoopController::new(oracle, checkpoints, config);

        let mut source = ReplaySource::new(vec![
            b"a,b\nc,d\nbad\n".to_vec(),
            b"Timestamp\ne,f\n".to_vec(),
            b"g,h\ni,j\n".to_vec(),
        ]);
        let mut assembler = SocketRecordAssembler::new(LineParser::new(2, "Timestamp"), 2).unwrap();
        let mut ctx = RunContext::new();

        let lifecycle = controller
            .run_socket(&mut source, &mut assembler, None, &mut ctx)
            .await
            .unwrap();

        assert_eq!(lifecycle, Lifecycle::Completed);
        assert_eq!(controller.state().epoch, 1);
        assert_eq!(controller.oracle().fitted, vec![2, 2]);
        assert_eq!(ctx.ingest.malformed, 1);
        assert_eq!(ctx.ingest.markers, 1);
        // final checkpoint only
        assert_eq!(controller.oracle().saved.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_continues_after_latest_epoch() {
        let dir = TempDir::new().unwrap();
        let mut controller = controller(&dir, ScriptedOracle::default(), 3);
        for epoch in [0, 1] {
            let name = controller.checkpoints.name(epoch, (0, 50), None);
            std::fs::write(controller.checkpoints.path_for(&name), b"w").unwrap();
        }

        let checkpoint = controller.resume().await.unwrap().unwrap();
        assert_eq!(checkpoint.name.epoch, 1);
        assert_eq!(controller.state().epoch, 2);
        assert_eq!(controller.oracle().loaded, vec![checkpoint.path]);
    }
}
