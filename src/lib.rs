//! Client-side synchronization layer for the tally score-tracking app:
//! per-entity cache coherency, ephemeral pairing sessions, and derived
//! player-group aggregation over a remote document store.

pub mod clock;
pub mod config;
mod error;
pub mod state;
pub mod store;
pub mod sync;

pub use error::SyncError;
pub use state::{SharedSync, SyncState};
