//! Remote document store abstraction and its implementations.

/// CouchDB-backed store implementation.
#[cfg(feature = "couch-store")]
pub mod couchdb;
/// Store error types.
pub mod error;
/// In-process store used by tests and offline development.
pub mod memory;
/// Entity definitions shared across layers.
pub mod models;
/// Builders for the logical persisted layout.
pub mod paths;

use std::sync::Arc;

use futures::{future::BoxFuture, stream::BoxStream};
use serde_json::{Map, Value};

use self::error::StoreResult;

/// Entity families the store distinguishes for change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Game definitions.
    Games,
    /// Player profiles.
    Players,
    /// Recorded matches.
    Matches,
    /// Derived player groups.
    PlayerGroups,
    /// Ephemeral pairing sessions (including the code index).
    Sessions,
}

impl EntityKind {
    /// Root path segment of the family's collection.
    pub fn root(self) -> &'static str {
        match self {
            EntityKind::Games => paths::GAMES,
            EntityKind::Players => paths::PLAYERS,
            EntityKind::Matches => paths::MATCHES,
            EntityKind::PlayerGroups => paths::PLAYER_GROUPS,
            EntityKind::Sessions => paths::SESSIONS,
        }
    }

    /// Classify a storage path by its first segment.
    pub fn from_path(path: &str) -> Option<Self> {
        let root = path.split('/').next()?;
        match root {
            paths::GAMES => Some(EntityKind::Games),
            paths::PLAYERS => Some(EntityKind::Players),
            paths::MATCHES => Some(EntityKind::Matches),
            paths::PLAYER_GROUPS => Some(EntityKind::PlayerGroups),
            paths::SESSIONS | paths::SESSIONS_BY_CODE => Some(EntityKind::Sessions),
            _ => None,
        }
    }
}

/// Change notification pushed by the store's subscription channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Family the change belongs to.
    pub entity: EntityKind,
    /// Specific record id, when the backend can scope the change.
    pub record_id: Option<String>,
}

/// Stream of change notifications for one subscription.
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn RemoteStore>;

/// Abstraction over the remote document store backing the application.
///
/// Paths are slash-separated logical locations (`games/{id}`,
/// `sessionsByCode/{code}`). Reading an interior path yields the whole
/// subtree as a JSON object keyed by child id. The store offers no
/// cross-path transactions; callers that need multi-write consistency
/// document the resulting races instead of assuming atomicity.
pub trait RemoteStore: Send + Sync {
    /// Read the value at `path`, `None` when absent.
    fn get(&self, path: &str) -> BoxFuture<'static, StoreResult<Option<Value>>>;

    /// Replace the value at `path`.
    fn set(&self, path: &str, value: Value) -> BoxFuture<'static, StoreResult<()>>;

    /// Merge the given fields into the object at `path`, creating it if absent.
    fn update(&self, path: &str, partial: Map<String, Value>)
    -> BoxFuture<'static, StoreResult<()>>;

    /// Delete the value at `path`; deleting an absent path is a no-op.
    fn remove(&self, path: &str) -> BoxFuture<'static, StoreResult<()>>;

    /// Reserve a server-generated child key under `path`.
    fn push(&self, path: &str) -> BoxFuture<'static, StoreResult<String>>;

    /// Subscribe to change notifications for one entity family, optionally
    /// scoped to a single record.
    fn subscribe(&self, entity: EntityKind, record_id: Option<String>) -> ChangeStream;
}
