mod crawler;
mod fetcher;
mod persister;

pub use crawler::*;
pub use fetcher::*;
pub use persister::*;
