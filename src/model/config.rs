use std::time::Duration;

use anyhow::anyhow;

use super::{BatchSpec, MAX_PAGE_SIZE, StdResult, plan_batches, star_partitions};

/// The hard ceiling on concurrent workers, guarding against secondary (abuse) rate limits.
pub const MAX_CONCURRENCY: usize = 8;

/// The retry policy for upstream calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            with_jitter: true,
        }
    }
}

/// The configuration of a crawl run. It is never mutated once the run started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlerConfig {
    /// Number of repositories to crawl.
    pub total_requested: u32,
    /// Number of repositories per batch.
    pub batch_size: u16,
    /// Number of repositories per upstream page.
    pub page_size: u16,
    /// Number of batches in flight.
    pub max_concurrency: usize,
    /// Capacity of the rate limiter bucket, in points.
    pub rate_capacity: u32,
    /// Refill rate of the rate limiter bucket, in points per hour.
    pub rate_refill_per_hour: u32,
    /// Points debited for each upstream page.
    pub page_cost: u32,
    /// Retry policy for upstream calls.
    pub backoff: BackoffPolicy,
    /// Maximum number of attempts of a storage transaction.
    pub storage_max_attempts: u32,
    /// Base delay between storage attempts.
    pub storage_base_delay: Duration,
    /// Delay between the start of two workers.
    pub worker_start_delay: Duration,
    /// Search partitions to crawl; derived from `base_query` and `min_stars` when empty.
    pub search_queries: Vec<String>,
    /// Query qualifiers shared by the derived partitions.
    pub base_query: String,
    /// Star count of the first derived partition.
    pub min_stars: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            total_requested: 100_000,
            batch_size: MAX_PAGE_SIZE,
            page_size: MAX_PAGE_SIZE,
            max_concurrency: 4,
            rate_capacity: 995,
            rate_refill_per_hour: 5000,
            page_cost: 1,
            backoff: BackoffPolicy::default(),
            storage_max_attempts: 3,
            storage_base_delay: Duration::from_millis(100),
            worker_start_delay: Duration::ZERO,
            search_queries: vec![],
            base_query: "is:public".to_string(),
            min_stars: 1,
        }
    }
}

impl CrawlerConfig {
    /// Checks that the configuration is usable.
    pub fn validate(&self) -> StdResult<()> {
        if self.total_requested == 0 {
            return Err(anyhow!("Total requested repositories must be positive"));
        }
        if self.batch_size == 0 || self.batch_size > MAX_PAGE_SIZE {
            return Err(anyhow!(
                "Batch size must be in 1..={MAX_PAGE_SIZE}, got {}",
                self.batch_size
            ));
        }
        if self.page_size == 0 || self.page_size > self.batch_size {
            return Err(anyhow!(
                "Page size must be in 1..={}, got {}",
                self.batch_size,
                self.page_size
            ));
        }
        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY {
            return Err(anyhow!(
                "Max concurrency must be in 1..={MAX_CONCURRENCY}, got {}",
                self.max_concurrency
            ));
        }
        if self.rate_capacity == 0 || self.rate_refill_per_hour == 0 {
            return Err(anyhow!("Rate limiter capacity and refill rate must be positive"));
        }
        if self.page_cost > self.rate_capacity {
            return Err(anyhow!(
                "Page cost {} exceeds the rate limiter capacity {}",
                self.page_cost,
                self.rate_capacity
            ));
        }
        if self.backoff.max_attempts == 0 || self.storage_max_attempts == 0 {
            return Err(anyhow!("At least one attempt is required"));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(anyhow!("Backoff base delay exceeds its maximum delay"));
        }

        Ok(())
    }

    /// The search partitions of the run.
    pub fn search_partitions(&self) -> Vec<String> {
        if self.search_queries.is_empty() {
            star_partitions(&self.base_query, self.min_stars, self.total_requested)
        } else {
            self.search_queries.clone()
        }
    }

    /// The ordered batches of the run.
    pub fn plan(&self) -> Vec<BatchSpec> {
        plan_batches(
            self.total_requested,
            self.batch_size,
            self.page_size,
            &self.search_partitions(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CrawlerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let invalid_configs = vec![
            CrawlerConfig {
                batch_size: 101,
                ..CrawlerConfig::default()
            },
            CrawlerConfig {
                page_size: 0,
                ..CrawlerConfig::default()
            },
            CrawlerConfig {
                batch_size: 50,
                page_size: 60,
                ..CrawlerConfig::default()
            },
            CrawlerConfig {
                max_concurrency: MAX_CONCURRENCY + 1,
                ..CrawlerConfig::default()
            },
            CrawlerConfig {
                rate_refill_per_hour: 0,
                ..CrawlerConfig::default()
            },
            CrawlerConfig {
                page_cost: 1000,
                ..CrawlerConfig::default()
            },
            CrawlerConfig {
                total_requested: 0,
                ..CrawlerConfig::default()
            },
        ];

        for config in invalid_configs {
            config
                .validate()
                .expect_err(&format!("Config should be invalid: {config:?}"));
        }
    }

    #[test]
    fn plans_over_derived_partitions() {
        let config = CrawlerConfig {
            total_requested: 250,
            batch_size: 100,
            page_size: 100,
            ..CrawlerConfig::default()
        };

        let batches = config.plan();

        assert_eq!(
            vec![100, 100, 50],
            batches.iter().map(|b| b.size()).collect::<Vec<_>>()
        );
        assert!(batches.iter().all(|b| b.query() == "is:public stars:1"));
    }

    #[test]
    fn plans_over_explicit_partitions() {
        let config = CrawlerConfig {
            total_requested: 100,
            search_queries: vec!["language:rust".to_string()],
            ..CrawlerConfig::default()
        };

        assert_eq!(vec!["language:rust".to_string()], config.search_partitions());
    }
}
