//! Retry decisions for finished attempts.
//!
//! Any non-success outcome is retried while the unit has retries left; the
//! unit goes back to the tail of the pending queue with `retry_count + 1`
//! and is rerun from scratch in a fresh context. Success finalizes at any
//! retry count.

use crate::aggregate::UnitResult;
use crate::outcome::Outcome;
use crate::unit::TestUnit;

/// What to do with a unit after one of its attempts settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run the unit again; `retry_count` has already been incremented.
    Requeue(TestUnit),
    /// The unit is done; record this result.
    Finalize(UnitResult),
}

/// Decides between requeueing and finalizing, and counts what it decided.
#[derive(Debug, Clone)]
pub struct RetryController {
    max_retries: u32,
    stats: RetryStats,
}

/// Counters over all decisions made in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Attempts that settled, including retries.
    pub attempts: usize,
    /// Attempts that were requeued.
    pub retries: usize,
    /// Units that passed after at least one failed attempt.
    pub flaky: usize,
    /// Units finalized as failures after exhausting retries.
    pub exhausted: usize,
}

impl RetryController {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            stats: RetryStats::default(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Routes one settled attempt.
    ///
    /// `worker_ordinal` is the slot the attempt ran in; it is recorded on
    /// the final result for diagnostics.
    pub fn on_outcome(&mut self, mut unit: TestUnit, outcome: Outcome, worker_ordinal: usize) -> Decision {
        self.stats.attempts += 1;

        if !outcome.is_success() && unit.retry_count < self.max_retries {
            self.stats.retries += 1;
            unit.retry_count += 1;
            return Decision::Requeue(unit);
        }

        if outcome.is_success() {
            if unit.retry_count > 0 {
                self.stats.flaky += 1;
            }
        } else {
            self.stats.exhausted += 1;
        }

        Decision::Finalize(UnitResult {
            unit: unit.identity(),
            outcome,
            worker_ordinal,
            retry_count: unit.retry_count,
        })
    }

    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::outcome::{UnitError, UnitMessage};

    fn failure() -> Outcome {
        UnitMessage::fail(Duration::from_millis(5), UnitError::new("nope")).into_outcome()
    }

    fn success() -> Outcome {
        UnitMessage::pass(Duration::from_millis(5)).into_outcome()
    }

    #[test]
    fn test_failure_requeues_until_exhausted() {
        let mut controller = RetryController::new(2);
        let mut unit = TestUnit::new("a");

        for expected in 1..=2 {
            match controller.on_outcome(unit, failure(), 1) {
                Decision::Requeue(next) => {
                    assert_eq!(next.retry_count, expected);
                    unit = next;
                }
                other => panic!("expected requeue, got {other:?}"),
            }
        }

        match controller.on_outcome(unit, failure(), 1) {
            Decision::Finalize(result) => {
                assert_eq!(result.retry_count, 2);
                assert!(!result.outcome.is_success());
            }
            other => panic!("expected finalize, got {other:?}"),
        }

        let stats = controller.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.exhausted, 1);
    }

    #[test]
    fn test_crash_is_retriable() {
        let mut controller = RetryController::new(1);
        let decision = controller.on_outcome(
            TestUnit::new("a"),
            Outcome::exited(Some(1), Duration::ZERO),
            1,
        );
        assert!(matches!(decision, Decision::Requeue(u) if u.retry_count == 1));
    }

    #[test]
    fn test_success_finalizes_immediately() {
        let mut controller = RetryController::new(3);
        let mut unit = TestUnit::new("a");
        unit.retry_count = 1;

        match controller.on_outcome(unit, success(), 2) {
            Decision::Finalize(result) => {
                assert_eq!(result.retry_count, 1);
                assert_eq!(result.worker_ordinal, 2);
                assert!(result.is_flaky());
            }
            other => panic!("expected finalize, got {other:?}"),
        }
        assert_eq!(controller.stats().flaky, 1);
    }

    #[test]
    fn test_zero_retries_finalizes_first_failure() {
        let mut controller = RetryController::new(0);
        assert!(matches!(
            controller.on_outcome(TestUnit::new("a"), failure(), 1),
            Decision::Finalize(_)
        ));
    }
}
