//! The run loop: bounded parallel execution with retries.
//!
//! The [`Scheduler`] owns a FIFO pending queue and a fixed set of capacity
//! slots. It launches contexts while slots are free, waits for any of them
//! to report back, routes each settled attempt through the
//! [`RetryController`], and records terminal results in the
//! [`ResultAggregator`].
//!
//! # Architecture
//!
//! ```text
//!   pending (FIFO) ──► fill ──► Executable::launch ──► context (thread / process)
//!        ▲                          │                          │
//!        │                    ExecutionHandle                  │ Message / Exception / Exit
//!        │                    (active, by launch id)           ▼
//!        │                          │◄──────────── mpsc ◄── EventSink
//!        │                          ▼
//!        │                       settle ◄──── deadline passed (timeout)
//!        │                          │
//!        └──── Requeue ◄── RetryController ──► Finalize ──► ResultAggregator
//! ```
//!
//! # Reconciliation
//!
//! Every launch gets a fresh launch id and every context event carries it.
//! The first event for a launch settles it: the handle is removed from the
//! active map and its span is finished. Any later result or exception with
//! the same id is ignored, so a result message followed by an exit, or a
//! timeout followed by a delayed result, is counted once.
//!
//! Settling does not free the slot. A launch settled by anything other than
//! its `Exit` moves to the draining map and keeps its slot until the context
//! has actually exited:
//!
//! - settled by a message or exception: the original deadline stays armed;
//!   if the context is still running when it passes, it is cancelled
//! - settled by a timeout: the context is cancelled at once
//! - once cancelled, a context gets [`SchedulerConfig::kill_grace`] to exit;
//!   after that its slot is released with a warning (thread contexts cannot
//!   be killed)
//!
//! | First event | Outcome |
//! |-------------|---------|
//! | `Message` | `Success` / `Failure` as reported |
//! | `Exception` | `Crash` (exception) |
//! | `Exit(code)` | `Crash` (exit), whatever the code |
//! | deadline | `Crash` (timeout), context cancelled |
//! | launch error | `Crash` (launch failed) |
//!
//! The loop is the only writer of the queue, the active and draining maps and
//! the slot set. It sleeps on the event channel and the earliest deadline, so it
//! never busy-polls.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::{Report, ResultAggregator};
use crate::context::{ContextEvent, ContextSignal, EventSink, Executable, LaunchId};
use crate::observe::{LaunchSpan, NoopObserver, Observer, SpanInfo};
use crate::outcome::{Outcome, duration_ms};
use crate::registry::{RegistryError, UnitRegistry};
use crate::report::{NullReporter, Reporter};
use crate::retry::{Decision, RetryController};
use crate::unit::{LaunchContext, TestUnit};

/// Upper bound for deadlines when the timeout is effectively infinite.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Default time a cancelled context gets to exit before its slot is released.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors that prevent a run from starting.
///
/// Once the first context is launched the run always completes; unit
/// failures only show up in the report.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}

/// Run-wide scheduling settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum number of contexts running at once.
    pub max_concurrency: usize,
    /// Retries per unit after the first attempt.
    pub max_retries: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Target base URL handed to every context.
    pub base_url: String,
    /// Debug flag handed to every context.
    pub debug: bool,
    /// How long a cancelled context may keep its slot before it is abandoned.
    pub kill_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            max_retries: 2,
            timeout: Duration::from_secs(60),
            base_url: "http://localhost:3000".to_string(),
            debug: false,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// Available parallelism minus one, but at least one.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Runs test units to completion across a bounded pool of contexts.
pub struct Scheduler<R: Reporter = NullReporter> {
    config: SchedulerConfig,
    registry: Arc<UnitRegistry>,
    observer: Arc<dyn Observer>,
    reporter: R,
}

impl Scheduler<NullReporter> {
    pub fn new(config: SchedulerConfig, registry: impl Into<Arc<UnitRegistry>>) -> Self {
        Self {
            config,
            registry: registry.into(),
            observer: Arc::new(NoopObserver),
            reporter: NullReporter,
        }
    }
}

impl<R: Reporter> Scheduler<R> {
    /// Replaces the progress reporter.
    pub fn with_reporter<R2: Reporter>(self, reporter: R2) -> Scheduler<R2> {
        Scheduler {
            config: self.config,
            registry: self.registry,
            observer: self.observer,
            reporter,
        }
    }

    /// Replaces the observability port.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Runs every unit until it reaches a terminal result and returns the report.
    ///
    /// All unit ids are resolved before anything is launched; an unknown id
    /// fails the whole run with [`SchedulerError::Registry`].
    pub async fn run_all(&self, units: Vec<TestUnit>) -> Result<Report, SchedulerError> {
        if self.config.max_concurrency == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        let executables = units
            .iter()
            .map(|unit| self.registry.resolve(&unit.id))
            .collect::<Result<Vec<_>, _>>()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting run {} with {} units (max {} parallel, {} retries, timeout {:?})",
            run_id,
            units.len(),
            self.config.max_concurrency,
            self.config.max_retries,
            self.config.timeout
        );
        self.reporter.on_run_start(&run_id, &units).await;

        let pending = units
            .into_iter()
            .zip(executables)
            .map(|(unit, executable)| Queued { unit, executable })
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut run = Run {
            scheduler: self,
            run_id,
            tx,
            pending,
            active: HashMap::new(),
            draining: HashMap::new(),
            free_slots: (1..=self.config.max_concurrency).collect(),
            next_launch_id: 0,
            retry: RetryController::new(self.config.max_retries),
            aggregator: ResultAggregator::new(),
        };

        loop {
            run.fill().await;
            let Some(deadline) = run.next_deadline() else {
                break;
            };

            select! {
                Some(event) = rx.recv() => run.handle(event).await,
                _ = sleep_until(deadline) => run.expire().await,
            }
        }

        let stats = run.retry.stats().clone();
        let report = run.aggregator.into_report(run.run_id);
        info!(
            "Run {} finished: {} passed, {} failed, {} flaky ({} attempts, {} retries) in {:?}",
            report.run_id,
            report.summary.passed,
            report.summary.failed,
            report.summary.flaky,
            stats.attempts,
            stats.retries,
            report.summary.duration_ms
        );
        self.reporter.on_run_complete(&report).await;

        Ok(report)
    }
}

/// A unit waiting for a slot, with its resolved entry point.
struct Queued {
    unit: TestUnit,
    executable: Arc<dyn Executable>,
}

/// A running context paired with its unit and capacity slot.
///
/// Exists only between launch and settlement.
struct ExecutionHandle {
    unit: TestUnit,
    executable: Arc<dyn Executable>,
    slot: usize,
    started: Instant,
    deadline: Instant,
    cancel: CancellationToken,
    span: LaunchSpan,
}

/// A settled launch whose context has not exited yet. Holds its slot.
struct Draining {
    unit_id: String,
    slot: usize,
    deadline: Instant,
    cancel: CancellationToken,
}

/// Mutable state of one `run_all` call.
struct Run<'a, R: Reporter> {
    scheduler: &'a Scheduler<R>,
    run_id: String,
    tx: mpsc::UnboundedSender<ContextEvent>,
    pending: VecDeque<Queued>,
    active: HashMap<LaunchId, ExecutionHandle>,
    draining: HashMap<LaunchId, Draining>,
    free_slots: BTreeSet<usize>,
    next_launch_id: LaunchId,
    retry: RetryController,
    aggregator: ResultAggregator,
}

impl<R: Reporter> Run<'_, R> {
    /// Launches pending units while slots are free.
    async fn fill(&mut self) {
        while !self.free_slots.is_empty() {
            let Some(queued) = self.pending.pop_front() else {
                break;
            };
            self.launch(queued).await;
        }
    }

    /// The earliest running or draining deadline, or `None` when the run is complete.
    fn next_deadline(&self) -> Option<Instant> {
        self.active
            .values()
            .map(|handle| handle.deadline)
            .chain(self.draining.values().map(|drain| drain.deadline))
            .min()
    }

    async fn launch(&mut self, queued: Queued) {
        let Some(slot) = self.free_slots.pop_first() else {
            self.pending.push_front(queued);
            return;
        };
        self.next_launch_id += 1;
        let launch_id = self.next_launch_id;
        let scheduler = self.scheduler;
        let config = &scheduler.config;
        let Queued { unit, executable } = queued;

        let context = LaunchContext {
            unit_id: unit.id.clone(),
            base_url: config.base_url.clone(),
            debug: config.debug,
            timeout_ms: duration_ms::millis(config.timeout),
            worker_ordinal: slot,
            attempt: unit.attempt(),
            run_id: self.run_id.clone(),
            launch_id,
            params: unit.params.clone(),
        };
        let span = LaunchSpan::start(
            Arc::clone(&scheduler.observer),
            SpanInfo {
                unit_id: unit.id.clone(),
                attempt: unit.attempt(),
                worker_ordinal: slot,
                launch_id,
                run_id: self.run_id.clone(),
                started_at: Utc::now(),
            },
        );

        let started = Instant::now();
        let deadline = deadline_after(started, config.timeout);
        let cancel = CancellationToken::new();

        info!(
            "Launching {} (attempt {}) on worker {} [{}]",
            unit.id,
            unit.attempt(),
            slot,
            executable.kind()
        );
        scheduler.reporter.on_attempt_start(&unit, slot).await;

        let sink = EventSink::new(launch_id, self.tx.clone());
        let launched = executable.launch(context, sink, cancel.clone());

        let handle = ExecutionHandle {
            unit,
            executable,
            slot,
            started,
            deadline,
            cancel,
            span,
        };

        match launched {
            Ok(()) => {
                self.active.insert(launch_id, handle);
            }
            Err(e) => {
                warn!("Failed to launch {}: {}", handle.unit.id, e);
                let slot = handle.slot;
                self.settle(handle, Outcome::launch_failed(e)).await;
                self.free_slots.insert(slot);
            }
        }
    }

    /// Settles the launch an event belongs to, unless it already settled.
    ///
    /// An `Exit` also releases the launch's slot, whether it settles the
    /// launch or ends its draining.
    async fn handle(&mut self, event: ContextEvent) {
        let launch_id = event.launch_id;
        let exited = matches!(event.signal, ContextSignal::Exit(_));

        let Some(handle) = self.active.remove(&launch_id) else {
            match self.draining.remove(&launch_id) {
                Some(drain) if exited => {
                    debug!("{} exited, worker {} is free", drain.unit_id, drain.slot);
                    self.free_slots.insert(drain.slot);
                }
                Some(drain) => {
                    debug!(
                        "Ignoring {} from settled launch {}",
                        signal_name(&event.signal),
                        launch_id
                    );
                    self.draining.insert(launch_id, drain);
                }
                None => debug!(
                    "Ignoring {} from finished launch {}",
                    signal_name(&event.signal),
                    launch_id
                ),
            }
            return;
        };

        let elapsed = handle.started.elapsed();
        let drain = Draining {
            unit_id: handle.unit.id.clone(),
            slot: handle.slot,
            deadline: handle.deadline,
            cancel: handle.cancel.clone(),
        };
        let outcome = match event.signal {
            ContextSignal::Message(message) => message.into_outcome(),
            ContextSignal::Exception(error) => Outcome::exception(error, elapsed),
            ContextSignal::Exit(code) => Outcome::exited(code, elapsed),
        };
        self.settle(handle, outcome).await;

        if exited {
            self.free_slots.insert(drain.slot);
        } else {
            self.draining.insert(launch_id, drain);
        }
    }

    /// Handles every deadline that has passed.
    ///
    /// A running launch settles as a timeout and is cancelled. A draining
    /// launch is cancelled on its first deadline and abandoned on the next.
    async fn expire(&mut self) {
        let now = Instant::now();
        let grace = self.scheduler.config.kill_grace;
        let timeout = self.scheduler.config.timeout;

        let expired: Vec<LaunchId> = self
            .active
            .iter()
            .filter(|(_, handle)| handle.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for launch_id in expired {
            let Some(handle) = self.active.remove(&launch_id) else {
                continue;
            };
            handle.cancel.cancel();
            warn!(
                "{} (attempt {}) timed out after {:?}",
                handle.unit.id,
                handle.unit.attempt(),
                timeout
            );
            let drain = Draining {
                unit_id: handle.unit.id.clone(),
                slot: handle.slot,
                deadline: deadline_after(now, grace),
                cancel: handle.cancel.clone(),
            };
            let outcome = Outcome::timed_out(timeout, handle.started.elapsed());
            self.settle(handle, outcome).await;
            self.draining.insert(launch_id, drain);
        }

        let overdue: Vec<LaunchId> = self
            .draining
            .iter()
            .filter(|(_, drain)| drain.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for launch_id in overdue {
            let Some(drain) = self.draining.get_mut(&launch_id) else {
                continue;
            };
            if !drain.cancel.is_cancelled() {
                debug!(
                    "{} is still running past its deadline, cancelling",
                    drain.unit_id
                );
                drain.cancel.cancel();
                drain.deadline = deadline_after(now, grace);
            } else if let Some(drain) = self.draining.remove(&launch_id) {
                warn!(
                    "{} did not stop within {:?} of cancellation, releasing worker {}",
                    drain.unit_id, grace, drain.slot
                );
                self.free_slots.insert(drain.slot);
            }
        }
    }

    /// Closes the launch's span and applies the retry policy.
    ///
    /// The slot is released by the caller, once the context is gone.
    async fn settle(&mut self, handle: ExecutionHandle, outcome: Outcome) {
        let ExecutionHandle {
            unit,
            executable,
            slot,
            span,
            ..
        } = handle;

        span.finish(&outcome);

        let decision = self.retry.on_outcome(unit.clone(), outcome.clone(), slot);
        let will_retry = matches!(decision, Decision::Requeue(_));
        self.scheduler
            .reporter
            .on_attempt_complete(&unit, &outcome, will_retry)
            .await;

        match decision {
            Decision::Requeue(next) => {
                warn!(
                    "{} attempt {} ended in {}, retrying ({}/{}): {}",
                    unit.id,
                    unit.attempt(),
                    outcome.label(),
                    next.retry_count,
                    self.retry.max_retries(),
                    outcome.error().map(|e| e.short_message()).unwrap_or_default()
                );
                self.pending.push_back(Queued {
                    unit: next,
                    executable,
                });
            }
            Decision::Finalize(result) => {
                info!(
                    "{} finished: {} after {} attempt(s)",
                    result.unit.id,
                    outcome.label(),
                    result.retry_count + 1
                );
                self.scheduler.reporter.on_unit_complete(&result).await;
                self.aggregator.record(result);
            }
        }
    }
}

fn deadline_after(from: Instant, wait: Duration) -> Instant {
    from.checked_add(wait).unwrap_or_else(|| from + FAR_FUTURE)
}

fn signal_name(signal: &ContextSignal) -> &'static str {
    match signal {
        ContextSignal::Message(_) => "result message",
        ContextSignal::Exception(_) => "exception",
        ContextSignal::Exit(_) => "exit",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::context::{LaunchError, ThreadUnit};
    use crate::outcome::{CrashCause, UnitError};

    struct Unlaunchable;

    impl Executable for Unlaunchable {
        fn kind(&self) -> &'static str {
            "broken"
        }

        fn launch(
            &self,
            _context: LaunchContext,
            _sink: EventSink,
            _cancel: CancellationToken,
        ) -> Result<(), LaunchError> {
            Err(LaunchError::Invalid("no such browser".to_string()))
        }
    }

    fn config(max_concurrency: usize, max_retries: u32) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency,
            max_retries,
            timeout: Duration::from_secs(5),
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_default_concurrency_is_at_least_one() {
        assert!(default_concurrency() >= 1);
    }

    #[tokio::test]
    async fn test_unknown_unit_fails_before_launch() {
        let launches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&launches);
        let registry = UnitRegistry::new().with(
            "known",
            ThreadUnit::new(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.pass();
                0
            }),
        );

        let result = Scheduler::new(config(2, 0), registry)
            .run_all(vec![TestUnit::new("known"), TestUnit::new("missing")])
            .await;

        assert!(matches!(
            result,
            Err(SchedulerError::Registry(RegistryError::Unknown(id))) if id == "missing"
        ));
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let result = Scheduler::new(config(0, 0), UnitRegistry::new())
            .run_all(Vec::new())
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_empty_run() {
        let report = Scheduler::new(config(2, 2), UnitRegistry::new())
            .run_all(Vec::new())
            .await
            .unwrap();
        assert_eq!(report.summary.total, 0);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_a_retried_crash() {
        let registry = UnitRegistry::new().with("broken", Unlaunchable);

        let report = Scheduler::new(config(1, 2), registry)
            .run_all(vec![TestUnit::new("broken")])
            .await
            .unwrap();

        assert_eq!(report.summary.failed, 1);
        let result = &report.errors[0];
        assert_eq!(result.retry_count, 2);
        assert!(matches!(
            result.outcome,
            Outcome::Crash {
                cause: CrashCause::LaunchFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_clean_exit_without_result_is_a_crash() {
        let registry = UnitRegistry::new().with("silent", ThreadUnit::new(|_| 0));

        let report = Scheduler::new(config(1, 0), registry)
            .run_all(vec![TestUnit::new("silent")])
            .await
            .unwrap();

        assert!(matches!(
            report.results[0].outcome,
            Outcome::Crash {
                cause: CrashCause::Exit,
                exit_code: Some(0),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_worker_ordinals_stay_within_capacity() {
        let ordinals = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ordinals);
        let registry = UnitRegistry::new().with(
            "unit",
            ThreadUnit::new(move |ctx| {
                seen.lock().unwrap().push(ctx.launch().worker_ordinal);
                std::thread::sleep(Duration::from_millis(10));
                ctx.pass();
                0
            }),
        );

        let units = (0..8).map(|_| TestUnit::new("unit")).collect();
        let report = Scheduler::new(config(3, 0), registry)
            .run_all(units)
            .await
            .unwrap();

        assert_eq!(report.summary.passed, 8);
        let ordinals = ordinals.lock().unwrap();
        assert_eq!(ordinals.len(), 8);
        assert!(ordinals.iter().all(|o| (1..=3).contains(o)));
    }

    #[tokio::test]
    async fn test_params_and_attempt_reach_context() {
        let registry = UnitRegistry::new().with(
            "param",
            ThreadUnit::new(|ctx| {
                let launch = ctx.launch();
                if launch.attempt < 2 {
                    ctx.fail(UnitError::new("first attempt always fails"));
                } else if launch.param("locale").and_then(|v| v.as_str()) == Some("de-DE") {
                    ctx.pass();
                } else {
                    ctx.fail(UnitError::new("missing locale"));
                }
                0
            }),
        );

        let report = Scheduler::new(config(1, 1), registry)
            .run_all(vec![TestUnit::new("param").with_param("locale", "de-DE")])
            .await
            .unwrap();

        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.results[0].retry_count, 1);
        assert_eq!(report.results[0].unit.params["locale"], "de-DE");
    }

    #[tokio::test]
    async fn test_uncooperative_context_is_abandoned_after_grace() {
        let registry = UnitRegistry::new().with(
            "stuck",
            ThreadUnit::new(|_ctx| {
                std::thread::sleep(Duration::from_secs(3));
                0
            }),
        );
        let config = SchedulerConfig {
            timeout: Duration::from_millis(50),
            kill_grace: Duration::from_millis(50),
            ..config(1, 0)
        };

        let started = std::time::Instant::now();
        let report = Scheduler::new(config, registry)
            .run_all(vec![TestUnit::new("stuck"), TestUnit::new("stuck")])
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.summary.failed, 2);
        assert!(report.results.iter().all(|r| matches!(
            r.outcome,
            Outcome::Crash {
                cause: CrashCause::Timeout,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_timed_out_context_holds_slot_until_exit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (now, max) = (Arc::clone(&running), Arc::clone(&peak));
        let registry = UnitRegistry::new().with(
            "slow",
            ThreadUnit::new(move |_ctx| {
                let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(current, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(150));
                now.fetch_sub(1, Ordering::SeqCst);
                0
            }),
        );
        let config = SchedulerConfig {
            timeout: Duration::from_millis(30),
            ..config(1, 0)
        };

        let report = Scheduler::new(config, registry)
            .run_all(vec![TestUnit::new("slow"), TestUnit::new("slow"), TestUnit::new("slow")])
            .await
            .unwrap();

        assert_eq!(report.summary.failed, 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }
}
