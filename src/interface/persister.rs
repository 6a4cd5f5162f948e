use chrono::NaiveDate;

use crate::{PersistReport, Repository, StorageResult};

/// A trait for persisting repository data to a storage medium.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RepositoryPersister: Sync + Send {
    /// Upserts the repositories and records their star count for `snapshot_date`, atomically.
    async fn persist(
        &self,
        repositories: &[Repository],
        snapshot_date: NaiveDate,
    ) -> StorageResult<PersistReport>;
}
