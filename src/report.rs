//! Run progress and final report output.
//!
//! Two separate concerns live here:
//!
//! - [`Reporter`]: live progress events emitted by the scheduler while the
//!   run is in flight (console progress bar, verbose logs).
//! - [`emit`]: the one-shot output of a finished [`Report`], which writes
//!   the JSON report to durable storage, optionally writes JUnit XML, prints
//!   the human-readable summary and forwards the summary to the observer.
//!
//! Only the JSON write can fail `emit`. The caller logs that failure; it
//! never changes the run's exit status.

pub mod json;
pub mod junit;

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::aggregate::{Report, Tally, UnitResult};
use crate::observe::Observer;
use crate::outcome::Outcome;
use crate::unit::TestUnit;

/// Errors from persisting a report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to create report directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Receives progress events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once before the first launch.
    async fn on_run_start(&self, run_id: &str, units: &[TestUnit]);

    /// Called when an attempt is launched.
    async fn on_attempt_start(&self, unit: &TestUnit, worker_ordinal: usize);

    /// Called when an attempt settles; `will_retry` tells whether it was requeued.
    async fn on_attempt_complete(&self, unit: &TestUnit, outcome: &Outcome, will_retry: bool);

    /// Called when a unit reaches its terminal result.
    async fn on_unit_complete(&self, result: &UnitResult);

    /// Called when every unit is terminal.
    async fn on_run_complete(&self, report: &Report);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _run_id: &str, _units: &[TestUnit]) {}
    async fn on_attempt_start(&self, _unit: &TestUnit, _worker_ordinal: usize) {}
    async fn on_attempt_complete(&self, _unit: &TestUnit, _outcome: &Outcome, _will_retry: bool) {}
    async fn on_unit_complete(&self, _result: &UnitResult) {}
    async fn on_run_complete(&self, _report: &Report) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, run_id: &str, units: &[TestUnit]) {
        for reporter in &self.reporters {
            reporter.on_run_start(run_id, units).await;
        }
    }

    async fn on_attempt_start(&self, unit: &TestUnit, worker_ordinal: usize) {
        for reporter in &self.reporters {
            reporter.on_attempt_start(unit, worker_ordinal).await;
        }
    }

    async fn on_attempt_complete(&self, unit: &TestUnit, outcome: &Outcome, will_retry: bool) {
        for reporter in &self.reporters {
            reporter.on_attempt_complete(unit, outcome, will_retry).await;
        }
    }

    async fn on_unit_complete(&self, result: &UnitResult) {
        for reporter in &self.reporters {
            reporter.on_unit_complete(result).await;
        }
    }

    async fn on_run_complete(&self, report: &Report) {
        for reporter in &self.reporters {
            reporter.on_run_complete(report).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
///
/// Keeps a [`Tally`] of terminal results and cross-checks it against the
/// final summary.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    tally: Mutex<Tally>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            tally: Mutex::new(Tally::default()),
            verbose,
        }
    }

    /// Counters over the terminal results seen so far.
    pub fn tally(&self) -> Tally {
        *self.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn println(&self, line: String) {
        match self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, run_id: &str, units: &[TestUnit]) {
        println!("Running {} units (run {})", units.len(), run_id);

        let pb = indicatif::ProgressBar::new(units.len() as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    async fn on_attempt_start(&self, unit: &TestUnit, worker_ordinal: usize) {
        if self.verbose {
            self.println(format!(
                "Running: {} (attempt {}, worker {})",
                unit.id,
                unit.attempt(),
                worker_ordinal
            ));
        }
    }

    async fn on_attempt_complete(&self, unit: &TestUnit, outcome: &Outcome, will_retry: bool) {
        if !will_retry {
            return;
        }
        let reason = outcome.error().map(|e| e.short_message()).unwrap_or_default();
        self.println(format!(
            "{} {} (attempt {}): {}",
            console::style("RETRY").yellow(),
            unit.id,
            unit.attempt(),
            console::style(reason).dim()
        ));
    }

    async fn on_unit_complete(&self, result: &UnitResult) {
        self.tally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(result);

        let status = match &result.outcome {
            Outcome::Success { .. } if result.is_flaky() => console::style("FLKY").yellow(),
            Outcome::Success { .. } => console::style("PASS").green(),
            Outcome::Failure { .. } => console::style("FAIL").red(),
            Outcome::Crash { .. } => console::style("CRSH").red().bold(),
        };
        if self.verbose || !result.passed() || result.is_flaky() {
            self.println(format!("{} {}", status, result.unit.id));
        }

        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            pb.inc(1);
        }
    }

    async fn on_run_complete(&self, report: &Report) {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }

        let tally = self.tally();
        if !tally.matches(&report.summary) {
            warn!(
                "Progress counters ({:?}) disagree with report summary ({:?})",
                tally, report.summary
            );
        }
    }
}

/// Where and how [`emit`] writes a report.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    /// Directory for the JSON report (created if missing).
    pub output_dir: PathBuf,
    /// Filename prefix for the JSON report.
    pub prefix: String,
    /// JUnit XML path, relative to `output_dir` unless absolute.
    pub junit_file: Option<PathBuf>,
    /// Test suite name used in JUnit XML.
    pub suite_name: String,
    /// Print the human-readable summary.
    pub print_summary: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("test-results"),
            prefix: "e2e-report".to_string(),
            junit_file: None,
            suite_name: "e2e".to_string(),
            print_summary: true,
        }
    }
}

/// Files written by [`emit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedReport {
    pub path: PathBuf,
    pub junit_path: Option<PathBuf>,
}

/// Persists, prints and forwards a finished report.
pub async fn emit(
    report: &Report,
    options: &ReportOptions,
    observer: &dyn Observer,
) -> Result<PersistedReport, ReportError> {
    let stored = json::write_report(report, &options.output_dir, &options.prefix);
    if let Ok(path) = &stored {
        info!("Report written to: {}", path.display());
    }

    let junit_path = match &options.junit_file {
        Some(file) => {
            let path = options.output_dir.join(file);
            match junit::write_junit(report, &path, &options.suite_name) {
                Ok(()) => {
                    info!("JUnit XML written to: {}", path.display());
                    Some(path)
                }
                Err(e) => {
                    warn!("Failed to write JUnit XML {}: {}", path.display(), e);
                    None
                }
            }
        }
        None => None,
    };

    if options.print_summary {
        print_summary(report);
    }

    if let Err(e) = observer.record_summary(report).await {
        warn!("Failed to forward run summary: {}", e);
    }
    observer.flush().await;

    Ok(PersistedReport {
        path: stored?,
        junit_path,
    })
}

/// Prints a summary of a report to the console.
///
/// Lists totals, pass/fail/flaky counts, duration, and one short message
/// per failed unit.
pub fn print_summary(report: &Report) {
    let summary = &report.summary;

    println!();
    println!("Test Results:");
    println!("  Total:   {}", summary.total);
    println!("  Passed:  {}", console::style(summary.passed).green());
    println!("  Failed:  {}", console::style(summary.failed).red());

    if summary.flaky > 0 {
        println!("  Flaky:   {}", console::style(summary.flaky).yellow());
    }

    println!("  Duration: {:?}", summary.duration_ms);

    println!();
    if summary.success() {
        println!("{}", console::style("All tests passed!").green().bold());
        return;
    }

    println!("{}", console::style("Some tests failed.").red().bold());
    println!();
    println!("Failed tests:");
    for result in &report.errors {
        println!(
            "  - {} ({}, {} retries)",
            result.unit.id,
            result.outcome.label(),
            result.retry_count
        );
        if let Some(error) = result.outcome.error() {
            println!("    {}", console::style(error.short_message()).dim());
        }
    }
}
