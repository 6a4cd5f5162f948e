use chrono::{NaiveDate, Utc};
use log::{debug, info};
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::{PersistReport, Repository, RepositoryPersister, StorageResult};

const SCHEMA: [&str; 2] = [
    r#"
CREATE TABLE IF NOT EXISTS repositories (
    id BIGINT PRIMARY KEY,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ,
    last_seen_at TIMESTAMPTZ NOT NULL
)
    "#,
    r#"
CREATE TABLE IF NOT EXISTS repo_star_snapshots (
    repo_id BIGINT NOT NULL REFERENCES repositories (id),
    snapshot_date DATE NOT NULL,
    star_count BIGINT NOT NULL,
    UNIQUE (repo_id, snapshot_date)
)
    "#,
];

/// A persister that stores repository metadata in a PostgreSQL database.
pub struct PostgresSqlPersister {
    pool: PgPool,
}

impl PostgresSqlPersister {
    /// Creates a new `PostgresSqlPersister` instance.
    pub async fn try_new(connection_string: &str, max_connections: u32) -> StorageResult<Self> {
        Ok(Self {
            pool: PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(connection_string)
                .await?,
        })
    }

    /// Creates the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("PostgreSQL schema is ready");

        Ok(())
    }
}

#[async_trait::async_trait]
impl RepositoryPersister for PostgresSqlPersister {
    async fn persist(
        &self,
        repositories: &[Repository],
        snapshot_date: NaiveDate,
    ) -> StorageResult<PersistReport> {
        let mut report = PersistReport::default();
        let last_seen_at = Utc::now();
        let mut transaction = self.pool.begin().await?;
        for repository in repositories {
            let (inserted,): (bool,) = sqlx::query_as(
                r#"
INSERT INTO repositories (id, owner, name, created_at, last_seen_at)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (id) DO UPDATE
SET owner = EXCLUDED.owner,
    name = EXCLUDED.name,
    created_at = COALESCE(repositories.created_at, EXCLUDED.created_at),
    last_seen_at = EXCLUDED.last_seen_at
RETURNING xmax = 0 AS inserted
                "#,
            )
            .bind(*repository.id())
            .bind(repository.owner().as_str())
            .bind(repository.name().as_str())
            .bind(repository.created_at())
            .bind(last_seen_at)
            .fetch_one(&mut *transaction)
            .await?;
            if inserted {
                debug!("Inserted {repository}");
                report.repositories_inserted += 1;
            } else {
                debug!("Updated {repository}");
                report.repositories_updated += 1;
            }

            let snapshot = sqlx::query(
                r#"
INSERT INTO repo_star_snapshots (repo_id, snapshot_date, star_count)
VALUES ($1, $2, $3)
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
