// Training module - oracle interface, training loop, checkpoints and scoring

pub mod checkpoint;
pub mod controller;
pub mod oracle;
pub mod scoring;
pub mod subprocess;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata, CheckpointName};
pub use controller::{ControllerConfig, Lifecycle, TrainingLoopController, TrainingState};
pub use oracle::{FitReport, Metrics, Oracle, Prediction};
pub use scoring::{ScoreReport, Scorer};
pub use subprocess::{OracleProcessConfig, SubprocessOracle};
