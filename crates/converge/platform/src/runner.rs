//! Command runner abstraction for the package-manager CLI.
//!
//! `CommandRunner` is what the adapters use to execute a binary.
//! `ProcessRunner` spawns real processes with a hard timeout.
//! `ScriptedRunner` records invocations and replays preset outputs.

use crate::error::{classify_failure, PlatformError, PlatformResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// A single command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program and arguments joined for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout on success, the classified failure otherwise
    pub fn into_result(self, program: &str) -> PlatformResult<String> {
        if self.is_success() {
            Ok(self.stdout)
        } else {
            Err(classify_failure(program, &self.stdout, &self.stderr))
        }
    }
}

/// Executes commands on behalf of the platform adapters
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is returned as output, not as an
    /// error; errors mean the process could not be run or timed out.
    async fn run(&self, invocation: &Invocation) -> PlatformResult<CommandOutput>;
}

/// Runner spawning real processes
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> PlatformResult<CommandOutput> {
        debug!(command = %invocation.display(), "Running command");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // a terminal interrupt must reach only this process, never a
        // package-manager call in flight
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PlatformError::Unreachable(format!("{} not found on PATH", invocation.program))
            }
            _ => PlatformError::Transient(format!("failed to spawn {}: {}", invocation.program, e)),
        })?;

        let output = match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PlatformError::Timeout {
                    operation: invocation.display(),
                    after_secs: invocation.timeout.as_secs(),
                });
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Test-double runner that records invocations and replays responses in order.
///
/// Once the script is exhausted every call succeeds with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<PlatformResult<CommandOutput>>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<PlatformResult<CommandOutput>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> PlatformResult<CommandOutput> {
        self.invocations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(invocation.clone());
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::success("")))
    }
}
