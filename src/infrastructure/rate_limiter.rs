use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use tokio::{
    sync::Mutex,
    time::{Duration, Instant, sleep},
};

/// A token bucket tracking the point budget shared by all the fetchers.
///
/// Points accrue continuously at `refill_per_hour / 3600` per second and never exceed the
/// capacity. Callers are served in arrival order: a caller waiting for points keeps the bucket
/// until it is served, so callers that arrive later can not starve it.
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    /// The maximum number of points in the bucket.
    capacity: u32,

    /// The refill rate, in points per second.
    refill_per_second: f64,

    /// The current budget.
    bucket: Mutex<Bucket>,

    /// The total number of points debited since creation.
    total_debited: AtomicU64,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, refill_per_second: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * refill_per_second).min(capacity);
        self.last_refill = now;
    }
}

impl TokenBucketRateLimiter {
    /// Creates a new `TokenBucketRateLimiter` with a full bucket.
    pub fn new(capacity: u32, refill_per_hour: u32) -> Self {
        Self {
            capacity,
            refill_per_second: refill_per_hour.max(1) as f64 / 3600.0,
            bucket: Mutex::new(Bucket {
                available: capacity as f64,
                last_refill: Instant::now(),
            }),
            total_debited: AtomicU64::new(0),
        }
    }

    /// Waits until `cost` points are available, then debits them.
    ///
    /// A cost above the capacity could never be served and is clamped to the capacity.
    /// Dropping the returned future while it waits debits nothing.
    pub async fn acquire(&self, cost: u32) {
        let cost = if cost > self.capacity {
            warn!(
                "Cost {cost} exceeds the rate limiter capacity {}, clamping",
                self.capacity
            );
            self.capacity
        } else {
            cost
        };
        let points = cost as f64;

        let mut bucket = self.bucket.lock().await;
        loop {
            bucket.refill(Instant::now(), self.capacity as f64, self.refill_per_second);
            if bucket.available >= points {
                bucket.available -= points;
                self.total_debited.fetch_add(cost as u64, Ordering::SeqCst);
                return;
            }
            let wait =
                Duration::from_secs_f64((points - bucket.available) / self.refill_per_second);
            debug!(
                "Rate limiter budget exhausted ({:.2}/{cost} points), waiting for {wait:?}",
                bucket.available
            );
            sleep(wait).await;
        }
    }

    /// Retrieves the points currently available.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), self.capacity as f64, self.refill_per_second);

        bucket.available
    }

    /// Retrieves the capacity of the bucket.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Retrieves the total number of points debited.
    pub fn total_debited(&self) -> u64 {
        self.total_debited.load(Ordering::SeqCst)
    }
}
