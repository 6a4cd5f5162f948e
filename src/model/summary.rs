use std::{fmt::Display, time::Duration};

use serde::Serialize;

use super::BatchSpec;

/// A batch that reached the `Failed` state, with what is needed to resume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    /// The failed batch
    pub batch: BatchSpec,
    /// The last error encountered
    pub last_error: String,
    /// The number of attempts made
    pub attempts: u32,
}

impl BatchFailure {
    /// Creates a new `BatchFailure`.
    pub fn new(batch: BatchSpec, last_error: &str, attempts: u32) -> Self {
        Self {
            batch,
            last_error: last_error.to_string(),
            attempts,
        }
    }
}

impl Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s): {}",
            self.batch, self.attempts, self.last_error
        )
    }
}

/// The outcome of a crawl run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Repositories written (inserted or refreshed)
    pub repositories_persisted: u32,
    /// Repositories seen for the first time
    pub repositories_inserted: u32,
    /// Snapshots written for the day
    pub snapshots_inserted: u32,
    pub elapsed: Duration,
    /// Whether the run was cancelled before all batches were dispatched
    pub cancelled: bool,
    pub failures: Vec<BatchFailure>,
}

impl RunSummary {
    /// Total number of batches of the run.
    pub fn total_batches(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    /// A run without any succeeded batch is a hard failure.
    pub fn is_complete_failure(&self) -> bool {
        self.succeeded == 0
    }
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Batches: succeeded={}, failed={}, skipped={}, Repositories: persisted={}, new={}, Snapshots: new={}, elapsed={:?}{}",
            self.succeeded,
            self.failed,
            self.skipped,
            self.repositories_persisted,
            self.repositories_inserted,
            self.snapshots_inserted,
            self.elapsed,
            if self.cancelled { ", cancelled" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_failure_when_nothing_succeeded() {
        let summary = RunSummary {
            failed: 3,
            ..RunSummary::default()
        };
        assert!(summary.is_complete_failure());

        let summary = RunSummary {
            succeeded: 1,
            failed: 2,
            ..RunSummary::default()
        };
        assert!(!summary.is_complete_failure());
        assert_eq!(3, summary.total_batches());
    }
}
