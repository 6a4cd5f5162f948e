mod batch;
mod config;
mod entities;
mod error;
mod response;
mod state;
mod summary;

pub use batch::*;
pub use config::*;
pub use entities::*;
pub use error::*;
pub use response::*;
pub use state::*;
pub use summary::*;
