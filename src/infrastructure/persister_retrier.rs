use std::{sync::Arc, time::Duration};

use chrono::NaiveDate;
use log::warn;
use tokio::time::sleep;

use crate::{PersistReport, Repository, RepositoryPersister, StorageError, StorageResult};

/// A struct that retries a RepositoryPersister a specified number of times in case of transient failure with exponential backoff strategy.
pub struct PersisterRetrier {
    /// The persister to be retried.
    persister: Arc<dyn RepositoryPersister>,
    /// The maximum number of attempts for a batch.
    max_attempts: u32,
    /// The base delay for exponential backoff.
    base_delay: Duration,
}

impl PersisterRetrier {
    /// Creates a new `PersisterRetrier` instance with the given maximum number of attempts.
    pub fn new(
        persister: Arc<dyn RepositoryPersister>,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            persister,
            max_attempts,
            base_delay,
        }
    }

    fn calculate_exponential_backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(31)))
    }
}

#[async_trait::async_trait]
impl RepositoryPersister for PersisterRetrier {
    /// Retries the persist operation on transient errors, up to the maximum number of attempts.
    ///
    /// An error following retries is reported with the number of attempts made.
    async fn persist(
        &self,
        repositories: &[Repository],
        snapshot_date: NaiveDate,
    ) -> StorageResult<PersistReport> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let error = match self.persister.persist(repositories, snapshot_date).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_transient() && attempts < self.max_attempts => e,
                Err(e) if attempts == 1 => return Err(e),
                Err(e) => {
                    return Err(StorageError::Retried {
                        attempts,
                        last_error: Box::new(e),
                    });
                }
            };
            let delay = self.calculate_exponential_backoff_delay(attempts);
            warn!(
                "Retrying persist: attempt={attempts}/{} delay={delay:?} cause={error}",
                self.max_attempts
            );
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use mockall::Sequence;
    use tokio::time::Instant;

    use super::*;
    use crate::MockRepositoryPersister;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn report() -> PersistReport {
        PersistReport {
            repositories_inserted: 1,
            snapshots_inserted: 1,
            ..PersistReport::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persist_success_on_first_attempt() {
        let persister = {
            let mut persister = MockRepositoryPersister::new();
            persister
                .expect_persist()
                .returning(|_, _| Ok(report()))
                .times(1);

            persister
        };
        let retrier = PersisterRetrier::new(Arc::new(persister), 3, Duration::from_millis(10));

        let result = retrier
            .persist(&[Repository::new(1, "org-1", "repository-1", 100)], today())
            .await;
        assert_eq!(result.unwrap(), report());
    }

    #[tokio::test(start_paused = true)]
    async fn persist_success_after_transient_failures() {
        let persister = {
            let mut persister = MockRepositoryPersister::new();
            let mut seq = Sequence::new();
            persister
                .expect_persist()
                .returning(|_, _| Err(StorageError::Transient("database is locked".to_string())))
                .times(2)
                .in_sequence(&mut seq);
            persister
                .expect_persist()
                .returning(|_, _| Ok(report()))
                .times(1)
                .in_sequence(&mut seq);

            persister
        };
        let retrier = PersisterRetrier::new(Arc::new(persister), 3, Duration::from_millis(10));
        let start = Instant::now();

        let result = retrier
            .persist(&[Repository::new(1, "org-1", "repository-1", 100)], today())
            .await
            .unwrap();
        assert_eq!(result, report());
        assert_eq!(Duration::from_millis(30), start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn persist_failure_after_max_attempts() {
        let persister = {
            let mut persister = MockRepositoryPersister::new();
            persister
                .expect_persist()
                .returning(|_, _| Err(StorageError::Transient("pool timed out".to_string())))
                .times(3);

            persister
        };
        let retrier = PersisterRetrier::new(Arc::new(persister), 3, Duration::from_millis(10));

        let error = retrier
            .persist(&[Repository::new(1, "org-1", "repository-1", 100)], today())
            .await
            .expect_err("Should return an error after max attempts");
        assert_eq!(3, error.attempts());
        assert_eq!(
            &StorageError::Transient("pool timed out".to_string()),
            error.last_error()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn integrity_violation_is_not_retried() {
        let persister = {
            let mut persister = MockRepositoryPersister::new();
            persister
                .expect_persist()
                .returning(|_, _| {
                    Err(StorageError::IntegrityViolation(
                        "FOREIGN KEY constraint failed".to_string(),
                    ))
                })
                .times(1);

            persister
        };
        let retrier = PersisterRetrier::new(Arc::new(persister), 3, Duration::from_millis(10));

        let error = retrier
            .persist(&[Repository::new(1, "org-1", "repository-1", 100)], today())
            .await
            .expect_err("Should fail immediately");
        assert!(!error.is_transient());
        assert_eq!(1, error.attempts());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_after_retries_reports_every_attempt() {
        let persister = {
            let mut persister = MockRepositoryPersister::new();
            let mut seq = Sequence::new();
            persister
                .expect_persist()
                .returning(|_, _| Err(StorageError::Transient("database is locked".to_string())))
                .times(1)
                .in_sequence(&mut seq);
            persister
                .expect_persist()
                .returning(|_, _| Err(StorageError::Invalid("no such table".to_string())))
                .times(1)
                .in_sequence(&mut seq);

            persister
        };
        let retrier = PersisterRetrier::new(Arc::new(persister), 3, Duration::from_millis(10));

        let error = retrier
            .persist(&[Repository::new(1, "org-1", "repository-1", 100)], today())
            .await
            .expect_err("Should fail on the permanent error");
        assert_eq!(2, error.attempts());
        assert_eq!(
            &StorageError::Invalid("no such table".to_string()),
            error.last_error()
        );
    }
}
