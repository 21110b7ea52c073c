//! Result aggregation and the report shape.
//!
//! The [`ResultAggregator`] is append-only: it stores one [`UnitResult`] per
//! finalized unit and nothing else. Every count in [`Summary`] is a pure
//! reduction over those results, so a summary computed at any point is
//! reproducible from the results alone.
//!
//! # Report JSON
//!
//! ```json
//! {
//!   "runId": "5f0c...",
//!   "summary": {"total": 2, "passed": 1, "failed": 1, "flaky": 0,
//!               "durationMs": 5312, "startedAt": "2024-05-01T10:00:00Z"},
//!   "results": [
//!     {"unit": {"id": "login"}, "outcome": {"status": "success", "durationMs": 812},
//!      "workerOrdinal": 1, "retryCount": 0},
//!     {"unit": {"id": "search"}, "outcome": {"status": "crash", "durationMs": 60000,
//!      "cause": "timeout", "error": {"message": "..."}}, "workerOrdinal": 2, "retryCount": 2}
//!   ],
//!   "errors": [ ...the failed entries of results... ]
//! }
//! ```

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::outcome::{Outcome, duration_ms};
use crate::unit::UnitIdentity;

/// The terminal result of one unit, after all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitResult {
    pub unit: UnitIdentity,
    pub outcome: Outcome,
    pub worker_ordinal: usize,
    pub retry_count: u32,
}

impl UnitResult {
    pub fn passed(&self) -> bool {
        self.outcome.is_success()
    }

    /// Passed, but only after at least one failed attempt.
    pub fn is_flaky(&self) -> bool {
        self.passed() && self.retry_count > 0
    }
}

/// Totals over a set of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub flaky: usize,
    #[serde(with = "duration_ms")]
    pub duration_ms: Duration,
    pub started_at: DateTime<Utc>,
}

impl Summary {
    /// Reduces `results` to a summary.
    pub fn from_results(results: &[UnitResult], started_at: DateTime<Utc>, duration: Duration) -> Self {
        let passed = results.iter().filter(|r| r.passed()).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            flaky: results.iter().filter(|r| r.is_flaky()).count(),
            duration_ms: duration,
            started_at,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    /// Process exit status for a run with this summary.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// The final aggregated report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub run_id: String,
    pub summary: Summary,
    pub results: Vec<UnitResult>,
    pub errors: Vec<UnitResult>,
}

impl Report {
    /// Builds a report, deriving `summary` and `errors` from `results`.
    pub fn new(
        run_id: impl Into<String>,
        results: Vec<UnitResult>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let summary = Summary::from_results(&results, started_at, duration);
        let errors = results.iter().filter(|r| !r.passed()).cloned().collect();
        Self {
            run_id: run_id.into(),
            summary,
            results,
            errors,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code()
    }
}

/// Append-only store of terminal results.
#[derive(Debug)]
pub struct ResultAggregator {
    results: Vec<UnitResult>,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl ResultAggregator {
    /// Starts aggregating; the run's start time is taken now.
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    pub fn record(&mut self, result: UnitResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[UnitResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Summary over everything recorded so far.
    pub fn summary(&self) -> Summary {
        Summary::from_results(&self.results, self.started_at, self.clock.elapsed())
    }

    /// Consumes the aggregator into the final report.
    pub fn into_report(self, run_id: impl Into<String>) -> Report {
        let duration = self.clock.elapsed();
        Report::new(run_id, self.results, self.started_at, duration)
    }
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Incrementally maintained counters, for live progress output.
///
/// Always agrees with [`Summary::from_results`] over the same results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub flaky: usize,
}

impl Tally {
    pub fn add(&mut self, result: &UnitResult) {
        self.total += 1;
        if result.passed() {
            self.passed += 1;
            if result.is_flaky() {
                self.flaky += 1;
            }
        } else {
            self.failed += 1;
        }
    }

    pub fn matches(&self, summary: &Summary) -> bool {
        self.total == summary.total
            && self.passed == summary.passed
            && self.failed == summary.failed
            && self.flaky == summary.flaky
    }
}
