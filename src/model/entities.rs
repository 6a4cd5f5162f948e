use std::{fmt::Display, ops::Deref, time::Duration};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::StdResult;

/// The stable identifier the upstream assigns to a repository.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryId(pub i64);

impl Deref for RepositoryId {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The name of a repository.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RepositoryName(pub String);

impl Deref for RepositoryName {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for RepositoryName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The login of the repository owner (user or organization).
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct OwnerName(pub String);

impl Deref for OwnerName {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for OwnerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The number of stars a repository has.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StarsCounter(pub u32);

impl Deref for StarsCounter {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for StarsCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository as observed upstream during the crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// The upstream identifier of the repository.
    id: RepositoryId,

    /// The owner of the repository.
    owner: OwnerName,

    /// The name of the repository.
    name: RepositoryName,

    /// When the repository was created upstream, if known.
    created_at: Option<DateTime<Utc>>,

    /// The number of stars the repository has.
    total_stars: StarsCounter,
}

impl Repository {
    /// Creates a new `Repository` instance.
    pub fn new(id: i64, owner: &str, name: &str, total_stars: u32) -> Self {
        Self {
            id: RepositoryId(id),
            owner: OwnerName(owner.to_string()),
            name: RepositoryName(name.to_string()),
            created_at: None,
            total_stars: StarsCounter(total_stars),
        }
    }

    /// Sets the upstream creation date.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Retrieves the repository identifier.
    pub fn id(&self) -> RepositoryId {
        self.id
    }

    /// Retrieves the owner name.
    pub fn owner(&self) -> &OwnerName {
        &self.owner
    }

    /// Retrieves the repository name.
    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    /// Retrieves the creation date.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Retrieves the total stars of the repository.
    pub fn total_stars(&self) -> StarsCounter {
        self.total_stars
    }
}

impl Display for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Repository: {}/{} (id={}), Stars: {}",
            self.owner, self.name, self.id, self.total_stars
        )
    }
}

/// A persisted repository row.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
}

/// A persisted star count observation, immutable once written.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct StarSnapshot {
    pub repo_id: i64,
    pub snapshot_date: NaiveDate,
    pub star_count: i64,
}

/// What a persister did with one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    /// Repositories seen for the first time
    pub repositories_inserted: u32,
    /// Repositories already known and refreshed
    pub repositories_updated: u32,
    /// New snapshots for the day
    pub snapshots_inserted: u32,
    /// Snapshots already recorded for the day and left untouched
    pub snapshots_ignored: u32,
}

impl PersistReport {
    /// Total number of repositories written.
    pub fn repositories_persisted(&self) -> u32 {
        self.repositories_inserted + self.repositories_updated
    }
}

/// A fetcher API rate limit, as reported by the server
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FetcherRateLimit {
    /// The maximum number of points that can be spent in the current window.
    pub limit: i32,
    /// The cost of the current request.
    pub cost: i32,
    /// The remaining points in the current window.
    pub remaining: i32,
    /// The time at which the rate limit will reset.
    pub reset_at: String,
}

impl FetcherRateLimit {
    #[cfg(test)]
    /// Creates a dummy `FetcherRateLimit` instance for testing purposes.
    pub fn dummy() -> Self {
        Self {
            limit: 5000,
            cost: 1,
            remaining: 4999,
            reset_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    /// Whether the server side budget is spent.
    pub fn is_exceeded(&self) -> bool {
        self.limit > 0 && self.remaining <= 0
    }

    /// Computes how long to wait until the server side budget is reset.
    pub fn duration_until_reset(&self, now: DateTime<Utc>) -> StdResult<Duration> {
        let reset_at = DateTime::parse_from_rfc3339(&self.reset_at)
            .with_context(|| format!("Invalid rate limit reset date: {}", self.reset_at))?
            .with_timezone(&Utc);

        Ok((reset_at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

impl Display for FetcherRateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RateLimit: points={}/{} (+{}), reset={}",
            self.limit - self.remaining,
            self.limit,
            self.cost,
            self.reset_at
        )
    }
}
