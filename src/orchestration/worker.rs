//! Worker invocation.
//!
//! The pool only sees `WorkerInvoker`: an instruction and a workspace path
//! in, text out. `CommandWorker` runs a headless CLI in the workspace and
//! reads its JSON result. Deadlines and cancellation are applied by the
//! caller; the child process is killed when the future is dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::process::Command;

use crate::{clog_debug, clog_trace, Error, Result};

/// What a worker produced for one instruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerOutput {
    pub output: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
}

impl WorkerOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }
}

/// Anything that can carry out an instruction inside a workspace.
pub trait WorkerInvoker: Send + Sync {
    fn invoke(&self, instruction: String, workspace: PathBuf) -> BoxFuture<'static, Result<WorkerOutput>>;
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    error: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    num_turns: Option<u32>,
}

/// Runs `<binary> -p <instruction> --output-format json` in the workspace.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    binary: PathBuf,
}

impl CommandWorker {
    /// Locate `command` on PATH.
    ///
    /// # Errors
    /// `Error::WorkerBinaryNotFound` if it cannot be found.
    pub fn new(command: &str) -> Result<Self> {
        let binary =
            which::which(command).map_err(|_| Error::WorkerBinaryNotFound(command.to_string()))?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(binary: PathBuf, instruction: String, workspace: PathBuf) -> Result<WorkerOutput> {
        clog_debug!(
            "CommandWorker::run binary={} cwd={}",
            binary.display(),
            workspace.display()
        );
        let output = Command::new(&binary)
            .arg("-p")
            .arg(&instruction)
            .arg("--output-format")
            .arg("json")
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        clog_trace!("CommandWorker stdout: {}", stdout.trim());

        if let Ok(parsed) = parse_response(&stdout) {
            return parsed;
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "worker exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Worker(message));
        }

        Ok(WorkerOutput::text(stdout.trim()))
    }
}

impl WorkerInvoker for CommandWorker {
    fn invoke(&self, instruction: String, workspace: PathBuf) -> BoxFuture<'static, Result<WorkerOutput>> {
        Box::pin(Self::run(self.binary.clone(), instruction, workspace))
    }
}

/// Parse the JSON result document.
///
/// The outer `Result` fails when the text is not a result document at all;
/// the inner one carries the worker's own success or error.
pub fn parse_response(json: &str) -> Result<Result<WorkerOutput>> {
    let raw: RawResponse = serde_json::from_str(json.trim())?;

    let failed = raw.is_error || raw.subtype.as_deref().is_some_and(|s| s.starts_with("error"));
    if failed || (raw.result.is_none() && raw.error.is_some()) {
        let message = raw
            .error
            .or(raw.result)
            .unwrap_or_else(|| "worker reported an error".to_string());
        return Ok(Err(Error::Worker(message)));
    }

    match raw.result {
        Some(output) => Ok(Ok(WorkerOutput {
            output,
            session_id: raw.session_id,
            cost_usd: raw.total_cost_usd,
            num_turns: raw.num_turns,
        })),
        None => Ok(Err(Error::Worker("unknown response format".to_string()))),
    }
}
