mod backoff;
mod crawler_parallel;
mod crawler_worker;
mod fetcher_batch;
mod fetcher_graphql;
mod persister_postgresql;
mod persister_retrier;
mod persister_sqlite;
mod rate_limiter;

pub use backoff::*;
pub use crawler_parallel::*;
pub use crawler_worker::*;
pub use fetcher_batch::*;
pub use fetcher_graphql::*;
pub use persister_postgresql::*;
pub use persister_retrier::*;
pub use persister_sqlite::*;
pub use rate_limiter::*;
