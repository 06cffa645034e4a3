// Checkpoint naming, metadata sidecars and latest lookup

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::controller::Lifecycle;
use super::oracle::Oracle;

/// Fewest digits an epoch is written with.
pub const MIN_EPOCH_WIDTH: usize = 3;
/// Digits for file indices.
pub const FILE_WIDTH: usize = 6;
/// Digits for stream positions in a batch range.
pub const POSITION_WIDTH: usize = 12;

/// Epoch digits needed so that every epoch of an `epochs`-long run sorts lexically.
pub fn epoch_width(epochs: u64) -> usize {
    epochs
        .saturating_sub(1)
        .to_string()
        .len()
        .max(MIN_EPOCH_WIDTH)
}

/// Checkpoint identity: `<family>-epoch-<EEE>-files-<s>-<e>[-batch-<s>-<e>].<ext>`.
///
/// Every number is zero-padded. File bounds and positions use fixed widths; the
/// epoch uses `epoch_width`, at least three digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointName {
    pub family: String,
    pub epoch: u64,
    pub epoch_width: usize,
    pub files: (u64, u64),
    pub batch: Option<(u64, u64)>,
    pub extension: String,
}

impl CheckpointName {
    pub fn new(
        family: impl Into<String>,
        extension: impl Into<String>,
        epoch: u64,
        files: (u64, u64),
        batch: Option<(u64, u64)>,
    ) -> Self {
        Self {
            family: family.into(),
            epoch,
            epoch_width: MIN_EPOCH_WIDTH,
            files,
            batch,
            extension: extension.into(),
        }
    }

    pub fn with_epoch_width(mut self, width: usize) -> Self {
        self.epoch_width = width.max(MIN_EPOCH_WIDTH);
        self
    }

    /// Parse a file name written by `Display`, for the given family and extension.
    pub fn parse(file_name: &str, family: &str, extension: &str) -> Option<Self> {
        let rest = file_name.strip_prefix(family)?.strip_prefix("-epoch-")?;
        let rest = if extension.is_empty() {
            rest
        } else {
            rest.strip_suffix(extension)?.strip_suffix('.')?
        };

        let parts: Vec<&str> = rest.split('-').collect();
        let num = |s: &str| s.parse::<u64>().ok();
        let (epoch, files, batch) = match parts.as_slice() {
            [e, "files", fs, fe] => (num(e)?, (num(fs)?, num(fe)?), None),
            [e, "files", fs, fe, "batch", bs, be] => {
                (num(e)?, (num(fs)?, num(fe)?), Some((num(bs)?, num(be)?)))
            }
            _ => return None,
        };
        if parts[0].len() < MIN_EPOCH_WIDTH {
            return None;
        }

        Some(Self::new(family, extension, epoch, files, batch).with_epoch_width(parts[0].len()))
    }

    /// True for checkpoints written when an epoch ran to its end.
    pub fn is_end_of_epoch(&self) -> bool {
        self.batch.is_none()
    }
}

impl fmt::Display for CheckpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-epoch-{:0ew$}-files-{:0fw$}-{:0fw$}",
            self.family,
            self.epoch,
            self.files.0,
            self.files.1,
            ew = self.epoch_width,
            fw = FILE_WIDTH
        )?;
        if let Some((start, end)) = self.batch {
            write!(f, "-batch-{:0pw$}-{:0pw$}", start, end, pw = POSITION_WIDTH)?;
        }
        if !self.extension.is_empty() {
            write!(f, ".{}", self.extension)?;
        }
        Ok(())
    }
}

/// Sidecar written next to each checkpoint as `<name>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub epoch: u64,
    pub files: (u64, u64),
    pub batch: Option<(u64, u64)>,
    pub loss: Option<f64>,
    pub val_loss: Option<f64>,
    pub lifecycle: Lifecycle,
    pub records_processed: u64,
}

/// A checkpoint found on disk or just written.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub name: CheckpointName,
    pub path: PathBuf,
    /// Missing when the sidecar is absent or unreadable
    pub metadata: Option<CheckpointMetadata>,
}

impl Checkpoint {
    /// Ordering key, oldest first.
    ///
    /// Within an epoch, the end-of-epoch checkpoint comes after any early-stop one,
    /// since a run only finishes an epoch it resumed mid-way. Sidecar times break ties.
    fn chronology(&self) -> (u64, bool, Option<DateTime<Utc>>, (u64, u64), (u64, u64)) {
        (
            self.name.epoch,
            self.name.is_end_of_epoch(),
            self.metadata.as_ref().map(|m| m.created_at),
            self.name.batch.unwrap_or((0, 0)),
            self.name.files,
        )
    }
}

/// Writes and finds checkpoints of one family in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    family: String,
    extension: String,
    epoch_width: usize,
}

impl CheckpointManager {
    /// Create new checkpoint manager
    pub fn new(
        checkpoint_dir: impl Into<PathBuf>,
        family: impl Into<String>,
        extension: impl Into<String>,
    ) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.into();
        fs::create_dir_all(&checkpoint_dir).with_context(|| {
            format!("Failed to create checkpoint directory: {:?}", checkpoint_dir)
        })?;

        Ok(Self {
            checkpoint_dir,
            family: family.into(),
            extension: extension.into(),
            epoch_width: MIN_EPOCH_WIDTH,
        })
    }

    /// Pad epochs wide enough for a run of `epochs` epochs.
    pub fn with_epoch_count(mut self, epochs: u64) -> Self {
        self.epoch_width = epoch_width(epochs);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn name(&self, epoch: u64, files: (u64, u64), batch: Option<(u64, u64)>) -> CheckpointName {
        CheckpointName::new(&self.family, &self.extension, epoch, files, batch)
            .with_epoch_width(self.epoch_width)
    }

    pub fn path_for(&self, name: &CheckpointName) -> PathBuf {
        self.checkpoint_dir.join(name.to_string())
    }

    fn sidecar_path(&self, name: &CheckpointName) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.json", name))
    }

    /// Have the oracle save its weights under `name`, then write the sidecar.
    pub async fn save<R, O>(
        &self,
        oracle: &mut O,
        name: CheckpointName,
        metadata: CheckpointMetadata,
    ) -> Result<Checkpoint>
    where
        R: Sync,
        O: Oracle<R> + ?Sized,
    {
        let path = self.path_for(&name);
        oracle.save(&path).await?;

        let sidecar = self.sidecar_path(&name);
        let json = serde_json::to_string_pretty(&metadata)
            .context("Failed to serialize checkpoint metadata")?;
        fs::write(&sidecar, json)
            .with_context(|| format!("Failed to write checkpoint metadata: {:?}", sidecar))?;

        tracing::info!(
            checkpoint = %name,
            epoch = metadata.epoch,
            lifecycle = ?metadata.lifecycle,
            val_loss = ?metadata.val_loss,
            "Saved checkpoint"
        );

        Ok(Checkpoint {
            name,
            path,
            metadata: Some(metadata),
        })
    }

    /// All checkpoints of this family, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut names: Vec<CheckpointName> = Vec::new();

        if !self.checkpoint_dir.exists() {
            return Ok(Vec::new());
        }

        for entry in fs::read_dir(&self.checkpoint_dir).with_context(|| {
            format!("Failed to read checkpoint directory: {:?}", self.checkpoint_dir)
        })? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let file_name = file_name.strip_suffix(".json").unwrap_or(file_name);

            if let Some(name) = CheckpointName::parse(file_name, &self.family, &self.extension) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        let mut checkpoints: Vec<Checkpoint> = names
            .into_iter()
            .map(|name| {
                let metadata = self.load_metadata(&name);
                Checkpoint {
                    path: self.path_for(&name),
                    name,
                    metadata,
                }
            })
            .collect();
        checkpoints.sort_by_key(Checkpoint::chronology);
        Ok(checkpoints)
    }

    /// Get the most recent checkpoint
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.list()?.pop())
    }

    fn load_metadata(&self, name: &CheckpointName) -> Option<CheckpointMetadata> {
        let path = self.sidecar_path(name);
        if !path.exists() {
            return None;
        }

        let parsed = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint metadata: {:?}", path))
            .and_then(|json| {
                serde_json::from_str(&json).context("Failed to parse checkpoint metadata JSON")
            });
        match parsed {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Failed to load checkpoint metadata");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineResult;
    use crate::training::oracle::{FitReport, Metrics, Prediction};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Writes a placeholder weights file and nothing else.
    struct Weights;

    #[async_trait]
    impl Oracle<u32> for Weights {
        async fn fit(&mut self, _batch: &[u32]) -> PipelineResult<FitReport> {
            Ok(FitReport::default())
        }

        async fn predict(&mut self, _batch: &[u32]) -> PipelineResult<Vec<Prediction>> {
            Ok(Vec::new())
        }

        async fn evaluate(&mut self, _batch: &[u32]) -> PipelineResult<Metrics> {
            Ok(Metrics::new())
        }

        async fn save(&mut self, path: &Path) -> PipelineResult<()> {
            fs::write(path, b"weights")?;
            Ok(())
        }

        async fn load(&mut self, _path: &Path) -> PipelineResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_name_formatting() {
        let name = CheckpointName::new("dnn", "h5", 3, (0, 50), None);
        assert_eq!(name.to_string(), "dnn-epoch-003-files-000000-000050.h5");

        let name = CheckpointName::new("lstm", "h5", 12, (50, 100), Some((256, 512)));
        assert_eq!(
            name.to_string(),
            "lstm-epoch-012-files-000050-000100-batch-000000000256-000000000512.h5"
        );

        let name = CheckpointName::new("dnn", "", 12, (0, 1), None).with_epoch_width(4);
        assert_eq!(name.to_string(), "dnn-epoch-0012-files-000000-000001");
    }

    #[test]
    fn test_epoch_width_covers_the_run() {
        assert_eq!(epoch_width(0), 3);
        assert_eq!(epoch_width(5), 3);
        assert_eq!(epoch_width(1000), 3);
        assert_eq!(epoch_width(1001), 4);
        assert_eq!(epoch_width(2500), 4);
    }

    #[test]
    fn test_name_parse_inverts_display() {
        for name in [
            CheckpointName::new("dnn", "ckpt", 7, (0, 50), None),
            CheckpointName::new("my-model", "h5", 101, (50, 100), Some((0, 128))),
            CheckpointName::new("dnn", "", 2, (0, 50), None),
            CheckpointName::new("dnn", "h5", 1999, (0, 50), None).with_epoch_width(4),
        ] {
            let parsed = CheckpointName::parse(&name.to_string(), &name.family, &name.extension);
            assert_eq!(parsed, Some(name));
        }

        assert_eq!(CheckpointName::parse("dnn-epoch-7-files-0-50.h5", "dnn", "h5"), None);
        assert_eq!(CheckpointName::parse("dnn-epoch-007-files-0.h5", "dnn", "h5"), None);
        assert_eq!(CheckpointName::parse("lstm-epoch-007-files-0-5.h5", "dnn", "h5"), None);
    }

    #[test]
    fn test_padding_makes_lexical_order_chronological() {
        let width = epoch_width(2500);
        let mut names: Vec<String> = [1001, 999, 2, 1000, 998]
            .iter()
            .map(|&e| {
                CheckpointName::new("dnn", "h5", e, (0, 50), None)
                    .with_epoch_width(width)
                    .to_string()
            })
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "dnn-epoch-0002-files-000000-000050.h5",
                "dnn-epoch-0998-files-000000-000050.h5",
                "dnn-epoch-0999-files-000000-000050.h5",
                "dnn-epoch-1000-files-000000-000050.h5",
                "dnn-epoch-1001-files-000000-000050.h5",
            ]
        );

        let mut names: Vec<String> = [(1000, 2000), (8, 16), (96, 128)]
            .iter()
            .map(|&b| CheckpointName::new("dnn", "h5", 4, (5, 10), Some(b)).to_string())
            .collect();
        names.sort();
        assert!(names[0].contains("-batch-000000000008-"));
        assert!(names[2].contains("-batch-000000001000-"));
    }

    #[test]
    fn test_latest_checkpoint_from_directory() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), "dnn", "h5")
            .unwrap()
            .with_epoch_count(2500);
        assert!(manager.latest().unwrap().is_none());

        for epoch in [1, 1000, 999] {
            let name = manager.name(epoch, (0, 50), None);
            fs::write(manager.path_for(&name), b"weights").unwrap();
        }
        fs::write(temp_dir.path().join("unrelated.txt"), b"x").unwrap();

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 3);

        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(latest.name.epoch, 1000);
        assert!(latest.metadata.is_none());
        assert_eq!(
            latest.path,
            temp_dir.path().join("dnn-epoch-1000-files-000000-000050.h5")
        );
    }

    #[tokio::test]
    async fn test_finished_epoch_is_later_than_early_stop_in_it() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), "dnn", "h5").unwrap();
        let metadata = |batch, lifecycle| CheckpointMetadata {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            epoch: 3,
            files: (0, 50),
            batch,
            loss: None,
            val_loss: None,
            lifecycle,
            records_processed: 0,
        };

        // an early stop part-way through epoch 3, then a resumed run that finished it
        let stopped = manager.name(3, (50, 100), Some((9000, 9256)));
        manager
            .save::<u32, _>(&mut Weights, stopped, metadata(Some((9000, 9256)), Lifecycle::EarlyStopped))
            .await
            .unwrap();
        let finished = manager.name(3, (0, 50), None);
        manager
            .save::<u32, _>(&mut Weights, finished.clone(), metadata(None, Lifecycle::Running))
            .await
            .unwrap();

        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(latest.name, finished);
        assert_eq!(manager.list().unwrap().len(), 2);
    }

    #[test]
    fn test_metadata_serialization() {
        let metadata = CheckpointMetadata {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            epoch: 4,
            files: (0, 50),
            batch: None,
            loss: Some(0.12),
            val_loss: Some(0.09),
            lifecycle: Lifecycle::EarlyStopped,
            records_processed: 4096,
        };

        let json = serde_json::to_string(&metadata).unwrap();
        let deserialized: CheckpointMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(metadata, deserialized);
    }
}
