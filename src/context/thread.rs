//! In-process execution contexts backed by dedicated OS threads.
//!
//! A [`ThreadUnit`] wraps a closure. Each launch spawns a fresh named thread
//! that calls the closure with a [`UnitContext`]; nothing is shared between
//! launches except what the closure itself captures.
//!
//! The three reporting channels map onto the thread's life:
//!
//! | Thread event | Signal |
//! |--------------|--------|
//! | `ctx.pass()` / `ctx.fail(..)` / `ctx.report(..)` | `Message` |
//! | the closure panics | `Exception`, then `Exit(Some(1))` |
//! | the closure returns `code` | `Exit(Some(code))` |
//!
//! # Example
//!
//! ```
//! use e2e_orchestrator::context::ThreadUnit;
//! use e2e_orchestrator::outcome::UnitError;
//!
//! let unit = ThreadUnit::new(|ctx| {
//!     if ctx.launch().base_url.starts_with("http") {
//!         ctx.pass();
//!     } else {
//!         ctx.fail(UnitError::new("bad base url"));
//!     }
//!     0
//! });
//! ```

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventSink, Executable, LaunchError};
use crate::outcome::{UnitError, UnitMessage};
use crate::unit::LaunchContext;

type UnitBody = dyn Fn(&UnitContext) -> i32 + Send + Sync;

/// An executable that runs a Rust closure on its own OS thread per launch.
#[derive(Clone)]
pub struct ThreadUnit {
    body: Arc<UnitBody>,
}

impl ThreadUnit {
    /// Wraps a unit body. The return value is the context's exit status.
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&UnitContext) -> i32 + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(body),
        }
    }
}

impl std::fmt::Debug for ThreadUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadUnit").finish_non_exhaustive()
    }
}

impl Executable for ThreadUnit {
    fn kind(&self) -> &'static str {
        "thread"
    }

    fn launch(
        &self,
        context: LaunchContext,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<(), LaunchError> {
        let body = Arc::clone(&self.body);
        let name = format!("e2e-worker-{}", context.worker_ordinal);

        std::thread::Builder::new().name(name).spawn(move || {
            let ctx = UnitContext::new(context, sink.clone(), cancel);
            let status = catch_unwind(AssertUnwindSafe(|| body(&ctx)));
            match status {
                Ok(code) => sink.exit(Some(code)),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    debug!("Launch {} panicked: {}", sink.launch_id(), message);
                    sink.exception(UnitError::new(message));
                    sink.exit(Some(1));
                }
            }
        })?;

        Ok(())
    }
}

/// The handle a thread unit's body receives.
///
/// Reporting is single-shot: the first `report`/`pass`/`fail` is delivered,
/// later ones are dropped with a warning.
pub struct UnitContext {
    launch: LaunchContext,
    sink: EventSink,
    cancel: CancellationToken,
    started: Instant,
    reported: AtomicBool,
}

impl UnitContext {
    fn new(launch: LaunchContext, sink: EventSink, cancel: CancellationToken) -> Self {
        Self {
            launch,
            sink,
            cancel,
            started: Instant::now(),
            reported: AtomicBool::new(false),
        }
    }

    /// Launch parameters: base URL, debug flag, timeout, ordinal, custom params.
    pub fn launch(&self) -> &LaunchContext {
        &self.launch
    }

    /// Whether the scheduler has given up on this launch.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time since the context started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sends an explicit result message. Returns `false` if one was already sent.
    pub fn report(&self, message: UnitMessage) -> bool {
        if self.reported.swap(true, Ordering::SeqCst) {
            warn!(
                "Unit {} reported more than once; ignoring extra result",
                self.launch.unit_id
            );
            return false;
        }
        self.sink.message(message);
        true
    }

    /// Reports success, timed from context start.
    pub fn pass(&self) -> bool {
        self.report(UnitMessage::pass(self.elapsed()))
    }

    /// Reports success with structured details.
    pub fn pass_with(&self, details: Value) -> bool {
        self.report(UnitMessage::pass(self.elapsed()).with_details(details))
    }

    /// Reports a failure of the unit's own checks.
    pub fn fail(&self, error: UnitError) -> bool {
        self.report(UnitMessage::fail(self.elapsed(), error))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
