//! Execution contexts: the isolated workers that run one attempt each.
//!
//! An [`Executable`] knows how to start a context for a unit. The context
//! runs truly in parallel with the scheduler (an OS thread or a child
//! process) and reports back over three independent channels, all funnelled
//! into one [`EventSink`]:
//!
//! ```text
//!   context ──► Message(UnitMessage)   explicit result, sent before a normal exit
//!           ──► Exception(UnitError)   the context's own harness blew up
//!           ──► Exit(Option<i32>)      termination, observed whether or not a result came first
//! ```
//!
//! The channels may race. The scheduler settles a launch on the first event
//! it sees and ignores the rest, keyed by the launch id every event carries.
//!
//! # Built-in Contexts
//!
//! | Executable | Module | Isolation |
//! |------------|--------|-----------|
//! | [`ThreadUnit`](thread::ThreadUnit) | [`thread`] | dedicated OS thread, panics caught |
//! | [`ProcessUnit`](process::ProcessUnit) | [`process`] | child process, JSON lines on stdout |

pub mod process;
pub mod thread;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::outcome::{UnitError, UnitMessage};
use crate::unit::LaunchContext;

pub use process::ProcessUnit;
pub use thread::{ThreadUnit, UnitContext};

/// Unique identifier of a single launch within a run.
pub type LaunchId = u64;

/// Errors raised while starting a context.
///
/// A launch error never aborts the run; the scheduler reconciles it as a
/// crash of that attempt.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The OS refused to spawn the thread or process.
    #[error("Failed to spawn context: {0}")]
    Spawn(#[from] std::io::Error),

    /// The launch parameters could not be encoded for the context.
    #[error("Failed to encode launch parameters: {0}")]
    Encode(#[from] serde_json::Error),

    /// The executable is misconfigured (e.g. an empty command line).
    #[error("Invalid executable: {0}")]
    Invalid(String),
}

/// What a context reported, without the launch it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextSignal {
    /// Channel 1: the explicit result message.
    Message(UnitMessage),
    /// Channel 2: an unexpected exception from the context's own execution.
    Exception(UnitError),
    /// Channel 3: termination with a status code (`None` when killed by a signal).
    Exit(Option<i32>),
}

/// A signal stamped with the launch that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEvent {
    pub launch_id: LaunchId,
    pub signal: ContextSignal,
}

/// The sending half that contexts use to report back to the scheduler.
///
/// Cheap to clone and usable from plain OS threads as well as async tasks.
/// Sends after the scheduler has finished are silently dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    launch_id: LaunchId,
    tx: mpsc::UnboundedSender<ContextEvent>,
}

impl EventSink {
    pub fn new(launch_id: LaunchId, tx: mpsc::UnboundedSender<ContextEvent>) -> Self {
        Self { launch_id, tx }
    }

    pub fn launch_id(&self) -> LaunchId {
        self.launch_id
    }

    pub fn message(&self, message: UnitMessage) {
        self.send(ContextSignal::Message(message));
    }

    pub fn exception(&self, error: UnitError) {
        self.send(ContextSignal::Exception(error));
    }

    pub fn exit(&self, code: Option<i32>) {
        self.send(ContextSignal::Exit(code));
    }

    fn send(&self, signal: ContextSignal) {
        let event = ContextEvent {
            launch_id: self.launch_id,
            signal,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(
                "Dropping signal for launch {}: scheduler is gone",
                self.launch_id
            );
        }
    }
}

/// An entry point that can start execution contexts.
///
/// `launch` must return promptly: the actual work happens on the context's
/// own thread or process. Implementations must eventually send an `Exit`
/// signal (or a message) for every successful launch; the scheduler's
/// timeout covers contexts that never do.
///
/// `cancel` fires when the scheduler gives up on the launch (timeout).
/// Contexts should stop as soon as practical; anything they report after
/// that is ignored.
pub trait Executable: Send + Sync {
    /// Short name of the context kind, for logs.
    fn kind(&self) -> &'static str;

    /// Starts a context for one attempt.
    fn launch(
        &self,
        context: LaunchContext,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<(), LaunchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_stamps_launch_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(42, tx);
        sink.exit(Some(3));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.launch_id, 42);
        assert_eq!(event.signal, ContextSignal::Exit(Some(3)));
    }

    #[test]
    fn test_sink_tolerates_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(1, tx);
        sink.exception(UnitError::new("late"));
    }
}
