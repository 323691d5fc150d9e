//! Sub-command execution.
//!
//! Deployment steps run external tools (git, conda, pip) through the
//! [`CommandRunner`] seam so the sequencer can be exercised without touching
//! the machine. The production [`ShellRunner`] streams combined stdout/stderr
//! line-by-line to the progress sink as it arrives, so a human watching a
//! long install sees output immediately rather than at exit.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::events::LogSink;

/// A program invocation: executable, arguments, optional working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Single-line rendering for logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Runs external commands on behalf of deployment steps.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, forwarding every output line to `sink` as it
    /// arrives. Returns true iff the process exited with code zero; failure
    /// to spawn is reported the same way (logged, then false). Callers decide
    /// whether a failure is fatal.
    async fn run(&self, spec: &CommandSpec, sink: &LogSink) -> bool;

    /// Run quietly and return trimmed stdout. Errors on spawn failure or a
    /// non-zero exit (with stderr in the message). Used for short queries
    /// like `git rev-parse` or `conda env list`.
    async fn capture(&self, spec: &CommandSpec) -> Result<String>;
}

/// The production runner: spawns real processes.
#[derive(Debug, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: &CommandSpec, sink: &LogSink) -> bool {
        sink.info(format!("running: {}", spec.display()));
        debug!(command = %spec.display(), cwd = ?spec.cwd, "Spawning command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                sink.warn(format!("failed to start {}: {e}", spec.program));
                return false;
            }
        };

        let stdout_task = spawn_line_forwarder(child.stdout.take(), sink.clone());
        let stderr_task = spawn_line_forwarder(child.stderr.take(), sink.clone());

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                sink.warn(format!("failed to wait on {}: {e}", spec.program));
                return false;
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if status.success() {
            true
        } else {
            let code = status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            sink.warn(format!("{} exited with code {code}", spec.program));
            false
        }
    }

    async fn capture(&self, spec: &CommandSpec) -> Result<String> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", spec.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{} failed: {}", spec.display(), stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Read one stream line-by-line, forwarding each line to the sink.
fn spawn_line_forwarder(
    stream: Option<impl AsyncRead + Unpin + Send + 'static>,
    sink: LogSink,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return;
        };

        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => sink.line(line.trim_end().to_string()),
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Progress;

    #[cfg(unix)]
    fn echo_spec() -> CommandSpec {
        CommandSpec::new("echo").arg("hello")
    }

    #[cfg(windows)]
    fn echo_spec() -> CommandSpec {
        CommandSpec::new("cmd").args(["/C", "echo", "hello"])
    }

    #[cfg(unix)]
    fn failing_spec() -> CommandSpec {
        CommandSpec::new("false")
    }

    #[cfg(windows)]
    fn failing_spec() -> CommandSpec {
        CommandSpec::new("cmd").args(["/C", "exit", "1"])
    }

    #[test]
    fn test_spec_builder_and_display() {
        let spec = CommandSpec::new("git")
            .args(["clone", "url"])
            .arg("dest")
            .current_dir("/tmp");
        assert_eq!(spec.display(), "git clone url dest");
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn test_run_success_streams_output() {
        let (sink, mut rx) = LogSink::channel();
        let ok = ShellRunner::new().run(&echo_spec(), &sink).await;
        assert!(ok);

        let mut saw_hello = false;
        while let Ok(event) = rx.try_recv() {
            if let Progress::CommandLine(line) = event {
                if line.contains("hello") {
                    saw_hello = true;
                }
            }
        }
        assert!(saw_hello);
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_is_false() {
        let sink = LogSink::discard();
        let ok = ShellRunner::new().run(&failing_spec(), &sink).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_run_missing_program_is_false_not_panic() {
        let sink = LogSink::discard();
        let spec = CommandSpec::new("definitely_not_a_real_program_xyz");
        let ok = ShellRunner::new().run(&spec, &sink).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_capture_returns_trimmed_stdout() {
        let out = ShellRunner::new().capture(&echo_spec()).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_capture_nonzero_exit_is_error() {
        let result = ShellRunner::new().capture(&failing_spec()).await;
        assert!(result.is_err());
    }
}
