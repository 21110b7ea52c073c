//! Attempt outcomes and the result message a unit sends back.
//!
//! Every launch ends in exactly one [`Outcome`]. A unit can produce it
//! explicitly by sending a [`UnitMessage`]; the orchestrator synthesizes a
//! [`Outcome::Crash`] when the context dies, throws, or times out without one.
//!
//! | Outcome | Source | Retriable |
//! |---------|--------|-----------|
//! | `Success` | result message with `success: true` | no |
//! | `Failure` | result message with `success: false` | yes |
//! | `Crash` | exception, non-zero exit, timeout, launch failure | yes |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An error description carried by failures and crashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl UnitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// First line of the message, for one-line summaries.
    pub fn short_message(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

impl std::fmt::Display for UnitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// The explicit result a unit sends before it exits normally.
///
/// On the wire (process contexts write it as one JSON line on stdout):
///
/// ```json
/// {"success": false, "duration": 1520.5, "error": {"message": "title mismatch", "stack": "..."}}
/// ```
///
/// `duration` is in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitMessage {
    pub success: bool,
    #[serde(default)]
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl UnitMessage {
    pub fn pass(duration: Duration) -> Self {
        Self {
            success: true,
            duration: duration.as_secs_f64() * 1000.0,
            error: None,
            details: None,
        }
    }

    pub fn fail(duration: Duration, error: UnitError) -> Self {
        Self {
            success: false,
            duration: duration.as_secs_f64() * 1000.0,
            error: Some(error),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The reported duration, clamped to zero for negative or non-finite values.
    pub fn reported_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration / 1000.0).unwrap_or_default()
    }

    /// Converts the message into the outcome it represents.
    pub fn into_outcome(self) -> Outcome {
        let duration = self.reported_duration();
        if self.success {
            Outcome::Success {
                duration_ms: duration,
                details: self.details,
            }
        } else {
            Outcome::Failure {
                duration_ms: duration,
                error: self
                    .error
                    .unwrap_or_else(|| UnitError::new("unit reported failure without an error")),
            }
        }
    }
}

/// Why a context terminated without an explicit result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CrashCause {
    /// The context exited without sending a result message.
    Exit,
    /// The context's own harness raised an unexpected exception.
    Exception,
    /// The context exceeded its configured timeout.
    Timeout,
    /// The context could not be started at all.
    LaunchFailed,
}

impl std::fmt::Display for CrashCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CrashCause::Exit => "exit",
            CrashCause::Exception => "exception",
            CrashCause::Timeout => "timeout",
            CrashCause::LaunchFailed => "launch failed",
        };
        f.write_str(s)
    }
}

/// The terminal result of a single launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    #[serde(rename_all = "camelCase")]
    Success {
        #[serde(with = "duration_ms")]
        duration_ms: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        #[serde(with = "duration_ms")]
        duration_ms: Duration,
        error: UnitError,
    },
    #[serde(rename_all = "camelCase")]
    Crash {
        #[serde(with = "duration_ms")]
        duration_ms: Duration,
        cause: CrashCause,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        error: UnitError,
    },
}

impl Outcome {
    /// Builds a crash for a context that exited without a result message.
    pub fn exited(exit_code: Option<i32>, duration: Duration) -> Self {
        let message = match exit_code {
            Some(0) => "context exited without reporting a result".to_string(),
            Some(code) => format!("context exited with code {code} without reporting a result"),
            None => "context was terminated by a signal without reporting a result".to_string(),
        };
        Outcome::Crash {
            duration_ms: duration,
            cause: CrashCause::Exit,
            exit_code,
            error: UnitError::new(message),
        }
    }

    /// Builds a crash for an uncaught exception in the context's harness.
    pub fn exception(error: UnitError, duration: Duration) -> Self {
        Outcome::Crash {
            duration_ms: duration,
            cause: CrashCause::Exception,
            exit_code: None,
            error: UnitError {
                message: format!("uncaught exception: {}", error.message),
                stack: error.stack,
            },
        }
    }

    /// Builds a crash for a context that outlived its timeout.
    pub fn timed_out(timeout: Duration, duration: Duration) -> Self {
        Outcome::Crash {
            duration_ms: duration,
            cause: CrashCause::Timeout,
            exit_code: None,
            error: UnitError::new(format!("context exceeded timeout of {timeout:?}")),
        }
    }

    /// Builds a crash for a context that could not be started.
    pub fn launch_failed(reason: impl std::fmt::Display) -> Self {
        Outcome::Crash {
            duration_ms: Duration::ZERO,
            cause: CrashCause::LaunchFailed,
            exit_code: None,
            error: UnitError::new(format!("failed to launch context: {reason}")),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn duration(&self) -> Duration {
        match self {
            Outcome::Success { duration_ms, .. }
            | Outcome::Failure { duration_ms, .. }
            | Outcome::Crash { duration_ms, .. } => *duration_ms,
        }
    }

    pub fn error(&self) -> Option<&UnitError> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { error, .. } | Outcome::Crash { error, .. } => Some(error),
        }
    }

    /// Short label used in logs and console output.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Failure { .. } => "failure",
            Outcome::Crash { .. } => "crash",
        }
    }
}

/// Serializes a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Whole milliseconds, saturating at `u64::MAX`.
    pub fn millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(millis(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
