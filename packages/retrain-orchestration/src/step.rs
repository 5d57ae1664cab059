use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::{error, info};

/// One external command of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl StepCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I, cwd: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Shell-like rendering for logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs one external command to completion (pluggable for tests)
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Returns the combined stdout/stderr; non-zero exit is a `StepFailure`
    async fn run(&self, command: &StepCommand) -> Result<String>;
}

/// Executor backed by real child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Kill steps that run longer than `timeout`; unbounded when `None`
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, command: &StepCommand) -> Result<String> {
        let rendered = command.display();
        info!("Running: {} (cwd={})", rendered, command.cwd.display());

        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start {}: {}", rendered, e);
                return Err(OrchestratorError::StepFailure {
                    command: rendered,
                    exit_code: None,
                    output: format!("failed to start: {}", e),
                });
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let finished = async {
            let combined = match (stdout, stderr) {
                (Some(stdout), Some(stderr)) => interleave_output(stdout, stderr).await?,
                _ => String::new(),
            };
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, combined))
        };

        let (status, combined) = match self.timeout {
            None => finished.await?,
            Some(limit) => match tokio::time::timeout(limit, finished).await {
                Ok(finished) => finished?,
                // The child is killed when it goes out of scope (kill_on_drop)
                Err(_) => {
                    error!("{} exceeded {}s, killed", rendered, limit.as_secs());
                    return Err(OrchestratorError::StepTimeout {
                        command: rendered,
                        timeout_secs: limit.as_secs(),
                        output: String::new(),
                    });
                }
            },
        };

        info!("{}", combined.trim());

        if !status.success() {
            return Err(OrchestratorError::StepFailure {
                command: rendered,
                exit_code: status.code(),
                output: combined.trim().to_string(),
            });
        }
        Ok(combined)
    }
}

/// Read both streams line by line into one buffer, in arrival order
async fn interleave_output(stdout: ChildStdout, stderr: ChildStderr) -> std::io::Result<String> {
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    // Partial lines survive a lost select race in these buffers
    let mut out_line = Vec::new();
    let mut err_line = Vec::new();
    let (mut out_done, mut err_done) = (false, false);
    let mut combined = String::new();

    while !(out_done && err_done) {
        tokio::select! {
            read = stdout.read_until(b'\n', &mut out_line), if !out_done => {
                if read? == 0 {
                    out_done = true;
                }
                combined.push_str(&String::from_utf8_lossy(&out_line));
                out_line.clear();
            }
            read = stderr.read_until(b'\n', &mut err_line), if !err_done => {
                if read? == 0 {
                    err_done = true;
                }
                combined.push_str(&String::from_utf8_lossy(&err_line));
                err_line.clear();
            }
        }
    }
    Ok(combined)
}
