mod config;
mod error;
mod store;

pub use config::CouchConfig;
pub use error::{CouchResult, CouchStoreError};
pub use store::CouchStore;
