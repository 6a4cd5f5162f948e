use std::{str::FromStr, time::Duration};

use chrono::{NaiveDate, Utc};
use log::{debug, info};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use crate::{
    PersistReport, Repository, RepositoryPersister, RepositoryRecord, StarSnapshot, StorageResult,
};

const SCHEMA: [&str; 2] = [
    r#"
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT,
    last_seen_at TEXT NOT NULL
)
    "#,
    r#"
CREATE TABLE IF NOT EXISTS repo_star_snapshots (
    repo_id INTEGER NOT NULL REFERENCES repositories (id),
    snapshot_date TEXT NOT NULL,
    star_count INTEGER NOT NULL,
    UNIQUE (repo_id, snapshot_date)
)
    "#,
];

/// A persister that stores repository metadata in a SQLite database.
pub struct SqlitePersister {
    pool: SqlitePool,
}

impl SqlitePersister {
    /// Creates a new `SqlitePersister` instance, creating the database file if needed.
    ///
    /// An in-memory database lives in a single connection: use `max_connections = 1` for it.
    pub async fn try_new(connection_string: &str, max_connections: u32) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(connection_string)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        Ok(Self {
            pool: SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await?,
        })
    }

    /// Creates the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("SQLite schema is ready");

        Ok(())
    }

    /// Retrieves all the persisted repositories, by identifier.
    pub async fn repository_records(&self) -> StorageResult<Vec<RepositoryRecord>> {
        Ok(sqlx::query_as::<_, RepositoryRecord>(
            "SELECT id, owner, name, created_at, last_seen_at FROM repositories ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Retrieves all the persisted star snapshots, by repository and date.
    pub async fn star_snapshots(&self) -> StorageResult<Vec<StarSnapshot>> {
        Ok(sqlx::query_as::<_, StarSnapshot>(
            "SELECT repo_id, snapshot_date, star_count FROM repo_star_snapshots ORDER BY repo_id, snapshot_date",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl RepositoryPersister for SqlitePersister {
    async fn persist(
        &self,
        repositories: &[Repository],
        snapshot_date: NaiveDate,
    ) -> StorageResult<PersistReport> {
        let mut report = PersistReport::default();
        let last_seen_at = Utc::now();
        // A deferred transaction fails with SQLITE_BUSY, without waiting, when upgrading to a
        // write lock held by another connection.
        let mut transaction = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        for repository in repositories {
            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS (SELECT 1 FROM repositories WHERE id = ?)")
                    .bind(*repository.id())
                    .fetch_one(&mut *transaction)
                    .await?;
            sqlx::query(
                r#"
INSERT INTO repositories (id, owner, name, created_at, last_seen_at)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT (id) DO UPDATE
SET owner = excluded.owner,
    name = excluded.name,
    created_at = COALESCE(repositories.created_at, excluded.created_at),
    last_seen_at = excluded.last_seen_at
                "#,
            )
            .bind(*repository.id())
            .bind(repository.owner().as_str())
            .bind(repository.name().as_str())
            .bind(repository.created_at())
            .bind(last_seen_at)
            .execute(&mut *transaction)
            .await?;
            if exists {
                debug!("Updated {repository}");
                report.repositories_updated += 1;
            } else {
                debug!("Inserted {repository}");
                report.repositories_inserted += 1;
            }

            let snapshot = sqlx::query(
                r#"
INSERT INTO repo_star_snapshots (repo_id, snapshot_date, star_count)
VALUES (?, ?, ?)
ON CONFLICT (repo_id, snapshot_date) DO NOTHING
                "#,
            )
            .bind(*repository.id())
            .bind(snapshot_date)
            .bind(*repository.total_stars() as i64)
            .execute(&mut *transaction)
            .await?;
            if snapshot.rows_affected() == 0 {
                report.snapshots_ignored += 1;
            } else {
                report.snapshots_inserted += 1;
            }
        }
        transaction.commit().await?;

        Ok(report)
    }
}
