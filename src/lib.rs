//! Daily star-count crawler for public GitHub repositories.
//!
//! The engine plans the crawl as ordered batches, fetches them concurrently under a shared
//! token-bucket budget, and persists each batch transactionally: repository metadata is upserted
//! and star snapshots are appended at most once per repository and day.

mod infrastructure;
mod interface;
mod model;

pub use infrastructure::*;
pub use interface::*;
pub use model::*;
