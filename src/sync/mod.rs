//! Core synchronization services built on top of the store abstraction.

/// Cache coherency controller: TTL, single-flight coalescing, debounce.
pub mod cache;
/// Player-group derivation from recent match history.
pub mod groups;
/// Ephemeral pairing session lifecycle and join codes.
pub mod session_manager;
