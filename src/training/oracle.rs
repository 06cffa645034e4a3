// Model oracle interface
//
// The numeric model lives outside this crate. Everything the pipeline needs from it
// goes through `Oracle`.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineResult;

/// Named metric values, e.g. `accuracy` or `loss`.
pub type Metrics = BTreeMap<String, f64>;

/// Result of fitting one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub loss: f64,
    pub val_loss: f64,
    #[serde(default)]
    pub metrics: Metrics,
}

/// One prediction per input record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    #[serde(default)]
    pub score: f64,
}

/// Opaque model. Implementations map their own failures to `OracleFailure`.
#[async_trait]
pub trait Oracle<R: Sync>: Send {
    async fn fit(&mut self, batch: &[R]) -> PipelineResult<FitReport>;

    async fn predict(&mut self, batch: &[R]) -> PipelineResult<Vec<Prediction>>;

    async fn evaluate(&mut self, batch: &[R]) -> PipelineResult<Metrics>;

    async fn save(&mut self, path: &Path) -> PipelineResult<()>;

    async fn load(&mut self, path: &Path) -> PipelineResult<()>;
}
