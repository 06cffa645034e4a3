// Model service subprocess
//
// The numeric model runs in a separate process (typically a Python script). Requests
// and responses are single-line JSON objects over the child's stdin and stdout.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::errors::{PipelineError, PipelineResult};

use super::oracle::{FitReport, Metrics, Oracle, Prediction};

/// How to start the model service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleProcessConfig {
    /// Executable, e.g. `python3`
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for OracleProcessConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["scripts/model_service.py".to_string()],
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request<'a, R> {
    Fit { records: &'a [R] },
    Predict { records: &'a [R] },
    Evaluate { records: &'a [R] },
    Save { path: &'a Path },
    Load { path: &'a Path },
}

#[derive(Deserialize)]
struct Response {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    body: Map<String, Value>,
}

#[derive(Deserialize)]
struct PredictBody {
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct EvaluateBody {
    metrics: Metrics,
}

/// `Oracle` backed by a long-running model service process.
pub struct SubprocessOracle {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    program: String,
}

impl SubprocessOracle {
    pub async fn spawn(config: &OracleProcessConfig) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start model service: {}", config.program))?;

        let stdin = child
            .stdin
            .take()
            .context("Model service stdin was not captured")?;
        let stdout = child
            .stdout
            .take()
            .context("Model service stdout was not captured")?;

        tracing::info!(program = %config.program, pid = ?child.id(), "Model service started");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            program: config.program.clone(),
        })
    }

    /// Close stdin and wait for the service to exit.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            mut child, stdin, ..
        } = self;
        drop(stdin);
        let status = child
            .wait()
            .await
            .context("Failed to wait for model service")?;
        tracing::info!(status = %status, "Model service exited");
        Ok(())
    }

    async fn call<R: Serialize>(
        &mut self,
        op: &'static str,
        request: &Request<'_, R>,
    ) -> PipelineResult<Map<String, Value>> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| PipelineError::oracle(op, format!("failed to encode request: {}", e)))?;
        line.push('\n');

        let io_failure = |e: std::io::Error| PipelineError::oracle(op, e);
        self.stdin.write_all(line.as_bytes()).await.map_err(io_failure)?;
        self.stdin.flush().await.map_err(io_failure)?;

        let reply = self
            .stdout
            .next_line()
            .await
            .map_err(io_failure)?
            .ok_or_else(|| {
                PipelineError::oracle(op, format!("{} closed its output", self.program))
            })?;

        let response: Response = serde_json::from_str(&reply)
            .map_err(|e| PipelineError::oracle(op, format!("unreadable response: {}", e)))?;
        if !response.ok {
            let message = response.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(PipelineError::oracle(op, message));
        }
        Ok(response.body)
    }

    async fn call_for<R: Serialize, T: for<'de> Deserialize<'de>>(
        &mut self,
        op: &'static str,
        request: &Request<'_, R>,
    ) -> PipelineResult<T> {
        let body = self.call(op, request).await?;
        serde_json::from_value(Value::Object(body))
            .map_err(|e| PipelineError::oracle(op, format!("unexpected response: {}", e)))
    }
}

#[async_trait]
impl<R> Oracle<R> for SubprocessOracle
where
    R: Serialize + Sync,
{
    async fn fit(&mut self, batch: &[R]) -> PipelineResult<FitReport> {
        self.call_for("fit", &Request::Fit { records: batch }).await
    }

    async fn predict(&mut self, batch: &[R]) -> PipelineResult<Vec<Prediction>> {
        let body: PredictBody = self
            .call_for("predict", &Request::Predict { records: batch })
            .await?;
        Ok(body.predictions)
    }

    async fn evaluate(&mut self, batch: &[R]) -> PipelineResult<Metrics> {
        let body: EvaluateBody = self
            .call_for("evaluate", &Request::Evaluate { records: batch })
            .await?;
        Ok(body.metrics)
    }

    async fn save(&mut self, path: &Path) -> PipelineResult<()> {
        self.call::<R>("save", &Request::Save { path }).await?;
        Ok(())
    }

    async fn load(&mut self, path: &Path) -> PipelineResult<()> {
        self.call::<R>("load", &Request::Load { path }).await?;
        Ok(())
    }
}
