//! Execution contexts backed by child processes.
//!
//! A [`ProcessUnit`] runs an external command per launch. Launch parameters
//! are passed as environment variables:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `E2E_UNIT_ID` | unit identifier |
//! | `E2E_BASE_URL` | target base URL |
//! | `E2E_DEBUG` | `1` or `0` |
//! | `E2E_TIMEOUT_MS` | per-attempt timeout |
//! | `E2E_WORKER_ORDINAL` | 1-based capacity slot |
//! | `E2E_ATTEMPT` | 1-based attempt number |
//! | `E2E_RUN_ID` / `E2E_LAUNCH_ID` | keys for per-launch scratch files |
//! | `E2E_PARAMS` | custom params as a JSON object |
//!
//! The child talks back with JSON lines on stdout:
//!
//! ```text
//! {"success": true, "duration": 812.4, "details": {"screens": 3}}
//! {"exception": {"message": "browser crashed", "stack": "..."}}
//! ```
//!
//! Any other output is treated as log output. Stdout is drained before the
//! exit status is collected, so a result line always reaches the scheduler
//! before the exit notification of the same launch. A cancelled child is
//! killed and reported as `Exit(None)`.

use std::path::PathBuf;
use std::process::Stdio;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::select;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventSink, Executable, LaunchError};
use crate::outcome::{UnitError, UnitMessage};
use crate::unit::LaunchContext;

/// An executable that runs an external command per launch.
#[derive(Debug, Clone)]
pub struct ProcessUnit {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl ProcessUnit {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Builds a unit from a shell-style command line such as `node tests/login.js --headless`.
    pub fn from_command_line(command: &str) -> Result<Self, LaunchError> {
        let mut words = shell_words::split(command)
            .map_err(|e| LaunchError::Invalid(format!("cannot parse `{command}`: {e}")))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| LaunchError::Invalid("empty command line".to_string()))?;
        Ok(Self::new(program).args(words))
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The program and arguments, for display.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| shell_words::quote(s).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Executable for ProcessUnit {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn launch(
        &self,
        context: LaunchContext,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<(), LaunchError> {
        if self.program.is_empty() {
            return Err(LaunchError::Invalid("empty program".to_string()));
        }

        let params = serde_json::to_string(&context.params)?;

        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
            .env("E2E_UNIT_ID", &context.unit_id)
            .env("E2E_BASE_URL", &context.base_url)
            .env("E2E_DEBUG", if context.debug { "1" } else { "0" })
            .env("E2E_TIMEOUT_MS", context.timeout_ms.to_string())
            .env("E2E_WORKER_ORDINAL", context.worker_ordinal.to_string())
            .env("E2E_ATTEMPT", context.attempt.to_string())
            .env("E2E_RUN_ID", &context.run_id)
            .env("E2E_LAUNCH_ID", context.launch_id.to_string())
            .env("E2E_PARAMS", params);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Invalid("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LaunchError::Invalid("stderr not captured".to_string()))?;

        let label = format!("{}#{}", context.unit_id, context.worker_ordinal);
        tokio::spawn(supervise(
            child,
            stdout,
            stderr,
            sink,
            cancel,
            label,
            context.debug,
        ));

        Ok(())
    }
}

/// One JSON line written by a unit on stdout.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireLine {
    Exception { exception: UnitError },
    Result(UnitMessage),
}

fn parse_wire_line(line: &str) -> Option<WireLine> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Pumps the child's output into the sink, then reports its exit status.
async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    sink: EventSink,
    cancel: CancellationToken,
    label: String,
    echo: bool,
) {
    let stdout_stream = LinesStream::new(BufReader::new(stdout).lines())
        .map(|line| OutputLine::Stdout(line.unwrap_or_default()));
    let stderr_stream = LinesStream::new(BufReader::new(stderr).lines())
        .map(|line| OutputLine::Stderr(line.unwrap_or_default()));
    let mut output = stream::select(stdout_stream, stderr_stream);

    loop {
        select! {
            _ = cancel.cancelled() => {
                terminate(&mut child, &label, &sink).await;
                return;
            }
            line = output.next() => match line {
                Some(OutputLine::Stdout(line)) => match parse_wire_line(&line) {
                    Some(WireLine::Result(message)) => sink.message(message),
                    Some(WireLine::Exception { exception }) => sink.exception(exception),
                    None => log_line(&label, &line, echo, false),
                },
                Some(OutputLine::Stderr(line)) => log_line(&label, &line, echo, true),
                None => break,
            }
        }
    }

    select! {
        _ = cancel.cancelled() => terminate(&mut child, &label, &sink).await,
        status = child.wait() => match status {
            Ok(status) => sink.exit(status.code()),
            Err(e) => {
                warn!("[{}] failed to wait for context: {}", label, e);
                sink.exit(None);
            }
        }
    }
}

/// Kills the child and reports the exit that releases its slot.
async fn terminate(child: &mut Child, label: &str, sink: &EventSink) {
    debug!("[{}] cancelled, killing context", label);
    match child.kill().await {
        Ok(()) => sink.exit(None),
        Err(e) => warn!("[{}] failed to kill context: {}", label, e),
    }
}

fn log_line(label: &str, line: &str, echo: bool, is_stderr: bool) {
    if echo {
        if is_stderr {
            eprintln!("[{}] {}", label, line);
        } else {
            println!("[{}] {}", label, line);
        }
    } else {
        debug!("[{}] {}", label, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_line() {
        match parse_wire_line(r#"  {"success": true, "duration": 12.5}"#) {
            Some(WireLine::Result(message)) => {
                assert!(message.success);
                assert_eq!(message.duration, 12.5);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_exception_line() {
        match parse_wire_line(r#"{"exception": {"message": "boom", "stack": "at main"}}"#) {
            Some(WireLine::Exception { exception }) => {
                assert_eq!(exception.message, "boom");
                assert_eq!(exception.stack.as_deref(), Some("at main"));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_plain_and_foreign_json_lines_are_output() {
        assert!(parse_wire_line("navigating to /login").is_none());
        assert!(parse_wire_line(r#"{"level": "info", "msg": "hi"}"#).is_none());
    }

    #[test]
    fn test_from_command_line() {
        let unit = ProcessUnit::from_command_line("node 'tests/log in.js' --headless").unwrap();
        assert_eq!(unit.program, "node");
        assert_eq!(unit.args, vec!["tests/log in.js", "--headless"]);
        assert_eq!(unit.command_line(), "node 'tests/log in.js' --headless");
    }

    #[test]
    fn test_empty_command_line_is_invalid() {
        assert!(matches!(
            ProcessUnit::from_command_line("   "),
            Err(LaunchError::Invalid(_))
        ));
    }
}
