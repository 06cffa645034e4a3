// Configuration structs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};
use crate::ingest::frame::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_LEN};
use crate::ingest::record::{CONNECTION_COLUMNS, DEFAULT_HEADER_PREFIX};
use crate::ingest::socket::DEFAULT_RECV_BUFFER;
use crate::ingest::source::DEFAULT_FILE_BATCH_SIZE;
use crate::training::subprocess::OracleProcessConfig;

/// Where records come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceConfig {
    /// Glob matching capture container files, e.g. `data/*.ncap.gz`
    Files(String),
    /// Stream name; the socket lives at `/tmp/<name>.sock`
    Socket(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    /// Name prefix, e.g. `dnn`
    pub family: String,
    pub extension: String,
    /// Save after every completed epoch (file mode)
    pub every_epoch: bool,
    /// Continue from the latest checkpoint in `dir`
    pub resume: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            family: "dnn".to_string(),
            extension: "h5".to_string(),
            every_epoch: true,
            resume: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: Option<SourceConfig>,

    /// Records per batch
    pub batch_size: usize,

    /// Container files loaded together (file mode)
    pub file_batch_size: usize,

    pub epochs: u64,

    /// Epochs before early stopping is considered
    pub patience: u64,

    /// Validation loss threshold for early stopping
    pub min_delta: f64,

    /// Fraction of records kept, in (0, 1]
    pub sample: f64,

    /// Seed for sampling; random when unset
    pub seed: Option<u64>,

    /// Bytes read from a container per chunk
    pub chunk_size: usize,

    /// Largest frame a container may declare
    pub max_frame_len: usize,

    /// Datagram receive buffer (socket mode)
    pub recv_buffer: usize,

    /// Fields per datagram line
    pub arity: usize,

    /// First-field prefix marking a header line
    pub header_prefix: String,

    pub checkpoint: CheckpointConfig,

    pub oracle: OracleProcessConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            batch_size: 256_000,
            file_batch_size: DEFAULT_FILE_BATCH_SIZE,
            epochs: 2500,
            patience: 3,
            min_delta: 1e-3,
            sample: 1.0,
            seed: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            recv_buffer: DEFAULT_RECV_BUFFER,
            arity: CONNECTION_COLUMNS.len(),
            header_prefix: DEFAULT_HEADER_PREFIX.to_string(),
            checkpoint: CheckpointConfig::default(),
            oracle: OracleProcessConfig::default(),
        }
    }
}

impl Config {
    /// Reject settings that cannot work, before any I/O happens.
    pub fn validate(&self) -> PipelineResult<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("file_batch_size", self.file_batch_size),
            ("chunk_size", self.chunk_size),
            ("max_frame_len", self.max_frame_len),
            ("recv_buffer", self.recv_buffer),
            ("arity", self.arity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PipelineError::config(format!("{} must be at least 1", name)));
            }
        }

        if !(self.sample > 0.0 && self.sample <= 1.0) {
            return Err(PipelineError::config(format!(
                "sample must be in (0, 1], got {}",
                self.sample
            )));
        }
        if !self.min_delta.is_finite() {
            return Err(PipelineError::config("min_delta must be a finite number"));
        }
        if matches!(self.source, Some(SourceConfig::Files(_))) && self.patience > self.epochs {
            return Err(PipelineError::config(format!(
                "patience ({}) exceeds epochs ({}); early stopping could never be checked",
                self.patience, self.epochs
            )));
        }
        if self.header_prefix.is_empty() {
            return Err(PipelineError::config("header_prefix must not be empty"));
        }

        let family = &self.checkpoint.family;
        if family.is_empty() || family.contains(['/', '\\']) {
            return Err(PipelineError::config(format!(
                "checkpoint family {:?} must be a plain file name prefix",
                family
            )));
        }

        match &self.source {
            Some(SourceConfig::Files(pattern)) if pattern.trim().is_empty() => {
                Err(PipelineError::config("files pattern must not be empty"))
            }
            Some(SourceConfig::Socket(stream)) if stream.is_empty() || stream.contains('/') => {
                Err(PipelineError::config(format!("invalid stream name {:?}", stream)))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.arity, 19);
        assert_eq!(config.file_batch_size, 50);
        assert_eq!(config.recv_buffer, 512);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_sample_rate_bounds() {
        for sample in [0.0, 1.01, -1.0] {
            let config = Config {
                sample,
                ..Config::default()
            };
            assert!(matches!(
                config.validate(),
                Err(PipelineError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_patience_beyond_epochs_rejected_for_files() {
        let mut config = Config {
            epochs: 2,
            patience: 3,
            source: Some(SourceConfig::Files("*.ncap".into())),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.source = Some(SourceConfig::Socket("Connection".into()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_checkpoint_family_must_be_plain() {
        let mut config = Config::default();
        config.checkpoint.family = "../dnn".into();
        assert!(config.validate().is_err());
    }
}
