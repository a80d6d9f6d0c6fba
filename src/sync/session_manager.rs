use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    clock::SharedClock,
    config::SessionConfig,
    error::SyncError,
    store::{
        SharedStore,
        models::{Session, decode_collection, decode_document, encode_document},
        paths,
    },
};

/// Characters a join code is drawn from.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Lifecycle owner for ephemeral pairing sessions.
///
/// Sessions are single-writer, short-lived records addressed by a short
/// join code; they are read straight from the store rather than cached.
/// Expiry is enforced lazily by readers; there is no background sweep, so
/// a session nobody reads again simply lingers until someone trips over it.
pub struct SessionManager {
    store: SharedStore,
    clock: SharedClock,
    config: SessionConfig,
}

impl SessionManager {
    /// Build a manager over the given store and clock.
    pub fn new(store: SharedStore, clock: SharedClock, config: SessionConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Create a session with a freshly reserved join code.
    ///
    /// The record and its code-index entry are two separate writes; the
    /// store offers no transaction spanning them, so a crash in between
    /// leaves an index-less record that [`SessionManager::get_session_by_code`]
    /// cleanup tolerates.
    pub async fn create_session(
        &self,
        created_by_id: &str,
        game_id: Option<&str>,
    ) -> Result<Session, SyncError> {
        if created_by_id.is_empty() {
            return Err(SyncError::InvalidInput(
                "session creator id must not be empty".into(),
            ));
        }

        let code = self.reserve_code().await?;
        let id = self.store.push(paths::SESSIONS).await?;
        let now = self.clock.now();
        let session = Session {
            id: id.clone(),
            code: code.clone(),
            participant_ids: Vec::new(),
            created_at: now,
            created_by_id: created_by_id.to_string(),
            game_id: game_id.map(str::to_string),
            last_activity_at: now,
        };

        let record_path = paths::session(&id);
        self.store
            .set(&record_path, encode_document(&record_path, &session)?)
            .await?;
        self.store
            .set(
                &paths::session_by_code(&code),
                Value::String(id.clone()),
            )
            .await?;

        info!(session = %id, code = %code, "created pairing session");
        Ok(session)
    }

    /// Whether the session has outlived its inactivity TTL. Pure, no I/O.
    pub fn is_expired(&self, session: &Session) -> bool {
        self.clock
            .now()
            .duration_since(session.last_activity_at)
            .is_ok_and(|idle| idle > self.config.ttl)
    }

    /// Resolve a join code to its live session.
    ///
    /// Reading an expired session deletes it (record and index) and returns
    /// `None`; a dangling index entry whose record is gone is cleaned up the
    /// same way.
    pub async fn get_session_by_code(&self, code: &str) -> Result<Option<Session>, SyncError> {
        let index_path = paths::session_by_code(code);
        let Some(index_value) = self.store.get(&index_path).await? else {
            return Ok(None);
        };
        let Some(session_id) = index_value.as_str().map(str::to_string) else {
            self.store.remove(&index_path).await?;
            return Ok(None);
        };

        let Some(session) = self.load(&session_id).await? else {
            self.store.remove(&index_path).await?;
            return Ok(None);
        };

        if self.is_expired(&session) {
            self.delete_record(&session).await?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Add a participant, bumping the activity timestamp.
    ///
    /// Idempotent: joining twice leaves the id in the set exactly once.
    /// Fails loudly on a missing or expired session; an expired session is
    /// also lazily deleted on the way out.
    pub async fn join_session(
        &self,
        session_id: &str,
        player_id: &str,
    ) -> Result<Session, SyncError> {
        let Some(mut session) = self.load(session_id).await? else {
            return Err(SyncError::NotFound(format!("session `{session_id}`")));
        };

        if self.is_expired(&session) {
            self.delete_record(&session).await?;
            return Err(SyncError::SessionExpired(session_id.to_string()));
        }

        if !session.participant_ids.iter().any(|id| id == player_id) {
            session.participant_ids.push(player_id.to_string());
        }
        session.last_activity_at = self.clock.now();
        self.persist_membership(&session).await?;

        debug!(session = %session.id, player = player_id, "player joined session");
        Ok(session)
    }

    /// Remove a participant; the last leaver deletes the session.
    ///
    /// A session that no longer exists is a no-op, not an error.
    pub async fn leave_session(&self, session_id: &str, player_id: &str) -> Result<(), SyncError> {
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(());
        };

        session.participant_ids.retain(|id| id != player_id);
        if session.participant_ids.is_empty() {
            self.delete_record(&session).await?;
            debug!(session = %session.id, "last participant left; session deleted");
            return Ok(());
        }

        session.last_activity_at = self.clock.now();
        self.persist_membership(&session).await?;
        debug!(session = %session.id, player = player_id, "player left session");
        Ok(())
    }

    /// All live sessions, most recently active first.
    ///
    /// Read-time filter only; expired sessions encountered here are left in
    /// place for their own readers to reap.
    pub async fn get_active_sessions(&self) -> Result<Vec<Session>, SyncError> {
        let value = self.store.get(paths::SESSIONS).await?;
        let mut sessions: Vec<Session> = decode_collection(paths::SESSIONS, value)?;
        sessions.retain(|session| !self.is_expired(session));
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    /// Delete a session and its code-index entry; tolerant of absence.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), SyncError> {
        let Some(session) = self.load(session_id).await? else {
            return Ok(());
        };
        self.delete_record(&session).await
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, SyncError> {
        let path = paths::session(session_id);
        let value = self.store.get(&path).await?;
        Ok(decode_document(&path, value)?)
    }

    /// Persist the membership fields of a join/leave.
    ///
    /// Read-modify-write without compare-and-swap: two concurrent joins can
    /// lose one append. Known limitation of the store contract.
    async fn persist_membership(&self, session: &Session) -> Result<(), SyncError> {
        let path = paths::session(&session.id);
        let mut partial = Map::new();
        partial.insert(
            "participantIDs".into(),
            encode_document(&path, &session.participant_ids)?,
        );
        partial.insert(
            "lastActivityAt".into(),
            encode_document(&path, &session.last_activity_at)?,
        );
        self.store.update(&path, partial).await?;
        Ok(())
    }

    async fn delete_record(&self, session: &Session) -> Result<(), SyncError> {
        self.store.remove(&paths::session(&session.id)).await?;
        self.store
            .remove(&paths::session_by_code(&session.code))
            .await?;
        debug!(session = %session.id, code = %session.code, "removed session and code index");
        Ok(())
    }

    async fn reserve_code(&self) -> Result<String, SyncError> {
        for attempt in 1..=self.config.code_attempts {
            let code = self.random_code();
            if self
                .store
                .get(&paths::session_by_code(&code))
                .await?
                .is_none()
            {
                return Ok(code);
            }
            debug!(attempt, code = %code, "join code collision; drawing again");
        }
        Err(SyncError::CodeGenerationExhausted {
            attempts: self.config.code_attempts,
        })
    }

    fn random_code(&self) -> String {
        let mut rng = rand::rng();
        (0..self.config.code_length)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use futures::future::BoxFuture;
    use serde_json::Map;

    use super::*;
    use crate::{
        clock::manual::ManualClock,
        store::{
            ChangeStream, EntityKind, RemoteStore, error::StoreResult, memory::MemoryStore,
        },
    };

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn manager(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> SessionManager {
        SessionManager::new(store, clock, SessionConfig::default())
    }

    #[tokio::test]
    async fn created_session_is_resolvable_by_code() {
        let store = MemoryStore::new();
        let sessions = manager(Arc::clone(&store), ManualClock::fixed());

        let created = sessions.create_session("p1", Some("g1")).await.unwrap();
        assert_eq!(created.code.len(), 6);
        assert!(
            created
                .code
                .bytes()
                .all(|c| CODE_ALPHABET.contains(&c))
        );
        assert!(created.participant_ids.is_empty());

        let found = sessions
            .get_session_by_code(&created.code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, created);
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let store = MemoryStore::new();
        let sessions = manager(Arc::clone(&store), ManualClock::fixed());

        let created = sessions.create_session("p1", None).await.unwrap();
        sessions.join_session(&created.id, "p1").await.unwrap();
        let joined = sessions.join_session(&created.id, "p1").await.unwrap();

        assert_eq!(joined.participant_ids, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn join_bumps_last_activity() {
        let store = MemoryStore::new();
        let clock = ManualClock::fixed();
        let sessions = manager(Arc::clone(&store), Arc::clone(&clock));

        let created = sessions.create_session("p1", None).await.unwrap();
        clock.advance(Duration::from_secs(60));
        let joined = sessions.join_session(&created.id, "p2").await.unwrap();

        assert_eq!(
            joined
                .last_activity_at
                .duration_since(created.last_activity_at)
                .unwrap(),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn expiry_boundary_is_strict() {
        let store = MemoryStore::new();
        let clock = ManualClock::fixed();
        let sessions = manager(Arc::clone(&store), Arc::clone(&clock));

        let session = sessions.create_session("p1", None).await.unwrap();

        clock.advance(DAY - Duration::from_millis(1));
        assert!(!sessions.is_expired(&session));

        clock.advance(Duration::from_millis(2));
        assert!(sessions.is_expired(&session));
    }

    #[tokio::test]
    async fn expired_session_is_lazily_deleted_on_code_lookup() {
        let store = MemoryStore::new();
        let clock = ManualClock::fixed();
        let sessions = manager(Arc::clone(&store), Arc::clone(&clock));

        let created = sessions.create_session("p1", None).await.unwrap();
        clock.advance(DAY + Duration::from_millis(1));

        assert!(
            sessions
                .get_session_by_code(&created.code)
                .await
                .unwrap()
                .is_none()
        );
        // Both the record and the index entry are gone.
        assert!(
            store
                .get(&paths::session(&created.id))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .get(&paths::session_by_code(&created.code))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn joining_an_expired_session_fails_and_reaps_it() {
        let store = MemoryStore::new();
        let clock = ManualClock::fixed();
        let sessions = manager(Arc::clone(&store), Arc::clone(&clock));

        let created = sessions.create_session("p1", None).await.unwrap();
        clock.advance(DAY + Duration::from_secs(1));

        let err = sessions.join_session(&created.id, "p2").await.unwrap_err();
        assert!(matches!(err, SyncError::SessionExpired(_)));
        assert!(
            store
                .get(&paths::session(&created.id))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn joining_a_missing_session_is_not_found() {
        let store = MemoryStore::new();
        let sessions = manager(Arc::clone(&store), ManualClock::fixed());

        let err = sessions.join_session("nope", "p1").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn leaving_a_missing_session_is_a_noop() {
        let store = MemoryStore::new();
        let sessions = manager(Arc::clone(&store), ManualClock::fixed());
        sessions.leave_session("nope", "p1").await.unwrap();
    }

    #[tokio::test]
    async fn dangling_code_index_is_cleaned_up() {
        let store = MemoryStore::new();
        let sessions = manager(Arc::clone(&store), ManualClock::fixed());

        store
            .set(
                &paths::session_by_code("ZZ99ZZ"),
                Value::String("ghost".into()),
            )
            .await
            .unwrap();

        assert!(
            sessions
                .get_session_by_code("ZZ99ZZ")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .get(&paths::session_by_code("ZZ99ZZ"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn active_sessions_filter_and_sort() {
        let store = MemoryStore::new();
        let clock = ManualClock::fixed();
        let sessions = manager(Arc::clone(&store), Arc::clone(&clock));

        let stale = sessions.create_session("p3", None).await.unwrap();
        clock.advance(DAY / 2);
        let old = sessions.create_session("p1", None).await.unwrap();
        clock.advance(Duration::from_secs(10));
        let recent = sessions.create_session("p2", None).await.unwrap();

        // Only `stale` crosses the TTL.
        clock.advance(DAY / 2 + Duration::from_secs(1));

        let active = sessions.get_active_sessions().await.unwrap();
        let ids: Vec<&str> = active.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![recent.id.as_str(), old.id.as_str()]);

        // Read-time filter only: the expired record is left for its own
        // readers to reap.
        assert!(
            store
                .get(&paths::session(&stale.id))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn full_pairing_lifecycle() {
        let store = MemoryStore::new();
        let sessions = manager(Arc::clone(&store), ManualClock::fixed());

        let created = sessions.create_session("p1", Some("g1")).await.unwrap();
        let code = created.code.clone();

        let joined = sessions.join_session(&created.id, "p1").await.unwrap();
        assert_eq!(joined.participant_ids, vec!["p1".to_string()]);

        let joined = sessions.join_session(&created.id, "p2").await.unwrap();
        assert_eq!(
            joined.participant_ids,
            vec!["p1".to_string(), "p2".to_string()]
        );

        sessions.leave_session(&created.id, "p1").await.unwrap();
        let remaining = sessions
            .get_session_by_code(&code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remaining.participant_ids, vec!["p2".to_string()]);

        sessions.leave_session(&created.id, "p2").await.unwrap();
        assert!(sessions.get_session_by_code(&code).await.unwrap().is_none());
        assert!(
            store
                .get(&paths::session(&created.id))
                .await
                .unwrap()
                .is_none()
        );
    }

    /// Store whose code index claims every code is taken, to exercise the
    /// generation ceiling.
    struct FullCodeSpace {
        inner: Arc<MemoryStore>,
        index_reads: AtomicU32,
    }

    impl RemoteStore for FullCodeSpace {
        fn get(&self, path: &str) -> BoxFuture<'static, StoreResult<Option<Value>>> {
            if path.starts_with(paths::SESSIONS_BY_CODE) {
                self.index_reads.fetch_add(1, Ordering::SeqCst);
                return Box::pin(async { Ok(Some(Value::String("taken".into()))) });
            }
            self.inner.get(path)
        }

        fn set(&self, path: &str, value: Value) -> BoxFuture<'static, StoreResult<()>> {
            self.inner.set(path, value)
        }

        fn update(
            &self,
            path: &str,
            partial: Map<String, Value>,
        ) -> BoxFuture<'static, StoreResult<()>> {
            self.inner.update(path, partial)
        }

        fn remove(&self, path: &str) -> BoxFuture<'static, StoreResult<()>> {
            self.inner.remove(path)
        }

        fn push(&self, path: &str) -> BoxFuture<'static, StoreResult<String>> {
            self.inner.push(path)
        }

        fn subscribe(&self, entity: EntityKind, record_id: Option<String>) -> ChangeStream {
            self.inner.subscribe(entity, record_id)
        }
    }

    #[tokio::test]
    async fn exhausted_code_space_fails_after_the_attempt_ceiling() {
        let store = Arc::new(FullCodeSpace {
            inner: MemoryStore::new(),
            index_reads: AtomicU32::new(0),
        });
        let sessions = SessionManager::new(
            Arc::clone(&store) as SharedStore,
            ManualClock::fixed(),
            SessionConfig::default(),
        );

        let err = sessions.create_session("p1", None).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::CodeGenerationExhausted { attempts: 10 }
        ));
        assert_eq!(store.index_reads.load(Ordering::SeqCst), 10);
    }
}
