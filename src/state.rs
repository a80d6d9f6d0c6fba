//! Shared synchronization state wiring the cache controllers, the session
//! manager, and the store's change-notification pump together.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt, StreamExt, stream};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    clock::SharedClock,
    config::SyncConfig,
    error::SyncError,
    store::{
        ChangeEvent, EntityKind, SharedStore,
        models::{
            Game, Identified, Match, Player, PlayerGroup, decode_collection, decode_document,
        },
        paths,
    },
    sync::{
        cache::{CacheController, Fetcher, PointFetcher, RefreshHook},
        groups::{GroupDeriver, sync_groups},
        session_manager::SessionManager,
    },
};

/// Shared handle to the synchronization state, constructed once at startup
/// and handed to every consumer.
pub type SharedSync = Arc<SyncState>;

/// Central service object owning one cache controller per entity family,
/// the derived match sub-caches, and the session manager.
///
/// The sub-caches (matches by game, by player, by group) are populated as a
/// side effect of the top-level match and group refreshes; they carry no TTL
/// of their own and live until a match mutation clears them wholesale.
pub struct SyncState {
    store: SharedStore,
    games: Arc<CacheController<Game>>,
    players: Arc<CacheController<Player>>,
    matches: Arc<CacheController<Match>>,
    groups: Arc<CacheController<PlayerGroup>>,
    sessions: SessionManager,
    matches_by_game: Arc<DashMap<String, Vec<Match>>>,
    matches_by_player: Arc<DashMap<String, Vec<Match>>>,
    matches_by_group: Arc<DashMap<String, Vec<Match>>>,
}

impl SyncState {
    /// Construct the synchronization state over a store and clock.
    pub fn new(store: SharedStore, clock: SharedClock, config: SyncConfig) -> SharedSync {
        let matches_by_game: Arc<DashMap<String, Vec<Match>>> = Arc::new(DashMap::new());
        let matches_by_player: Arc<DashMap<String, Vec<Match>>> = Arc::new(DashMap::new());
        let matches_by_group: Arc<DashMap<String, Vec<Match>>> = Arc::new(DashMap::new());

        let games = Arc::new(
            CacheController::new(
                "games",
                config.cache.games_ttl,
                config.cache.debounce,
                Arc::clone(&clock),
                collection_fetcher::<Game>(&store, paths::GAMES),
            )
            .with_point_fetcher(point_fetcher::<Game>(&store, paths::game)),
        );

        let players = Arc::new(
            CacheController::new(
                "players",
                config.cache.players_ttl,
                config.cache.debounce,
                Arc::clone(&clock),
                collection_fetcher::<Player>(&store, paths::PLAYERS),
            )
            .with_point_fetcher(point_fetcher::<Player>(&store, paths::player)),
        );

        let partition_hook: RefreshHook<Match> = {
            let by_game = Arc::clone(&matches_by_game);
            let by_player = Arc::clone(&matches_by_player);
            Arc::new(move |snapshot: &[Match]| {
                by_game.clear();
                by_player.clear();
                for record in snapshot {
                    by_game
                        .entry(record.game_id.clone())
                        .or_default()
                        .push(record.clone());
                    for player_id in &record.player_ids {
                        by_player
                            .entry(player_id.clone())
                            .or_default()
                            .push(record.clone());
                    }
                }
            })
        };
        let matches = Arc::new(
            CacheController::new(
                "matches",
                config.cache.matches_ttl,
                config.cache.debounce,
                Arc::clone(&clock),
                collection_fetcher::<Match>(&store, paths::MATCHES),
            )
            .with_refresh_hook(partition_hook),
        );

        let groups_fetcher: Fetcher<PlayerGroup> = {
            let store = Arc::clone(&store);
            let clock = Arc::clone(&clock);
            let by_group = Arc::clone(&matches_by_group);
            let window = config.cache.group_window;
            Arc::new(move || {
                let store = Arc::clone(&store);
                let clock = Arc::clone(&clock);
                let by_group = Arc::clone(&by_group);
                let deriver = GroupDeriver::new(window);
                async move {
                    let matches: Vec<Match> =
                        decode_collection(paths::MATCHES, store.get(paths::MATCHES).await?)?;
                    let players: Vec<Player> =
                        decode_collection(paths::PLAYERS, store.get(paths::PLAYERS).await?)?;
                    let outcome =
                        sync_groups(&store, &deriver, clock.now(), &matches, &players).await?;
                    by_group.clear();
                    for (group_id, group_matches) in outcome.matches_by_group {
                        by_group.insert(group_id, group_matches);
                    }
                    Ok(outcome.groups)
                }
                .boxed()
            })
        };
        let groups = Arc::new(CacheController::new(
            "playerGroups",
            config.cache.groups_ttl,
            config.cache.debounce,
            Arc::clone(&clock),
            groups_fetcher,
        ));

        let sessions = SessionManager::new(Arc::clone(&store), clock, config.session);

        Arc::new(Self {
            store,
            games,
            players,
            matches,
            groups,
            sessions,
            matches_by_game,
            matches_by_player,
            matches_by_group,
        })
    }

    /// All games, served from cache within the TTL.
    pub async fn fetch_games(&self, force: bool) -> Result<Vec<Game>, SyncError> {
        self.games.fetch(force).await
    }

    /// All players, served from cache within the TTL.
    pub async fn fetch_players(&self, force: bool) -> Result<Vec<Player>, SyncError> {
        self.players.fetch(force).await
    }

    /// All matches, served from cache within the TTL. Refreshing also
    /// repopulates the by-game and by-player sub-caches.
    pub async fn fetch_matches(&self, force: bool) -> Result<Vec<Match>, SyncError> {
        self.matches.fetch(force).await
    }

    /// Derived player groups for the recent-match window. Refreshing runs a
    /// derivation pass, upserts groups in the store, and repopulates the
    /// by-group sub-cache.
    pub async fn fetch_player_groups(&self, force: bool) -> Result<Vec<PlayerGroup>, SyncError> {
        self.groups.fetch(force).await
    }

    /// Matches of one game, from the sub-cache the match fetch maintains.
    pub async fn matches_for_game(
        &self,
        game_id: &str,
        force: bool,
    ) -> Result<Vec<Match>, SyncError> {
        self.matches.fetch(force).await?;
        Ok(self
            .matches_by_game
            .get(game_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    /// Matches one player took part in, from the sub-cache.
    pub async fn matches_for_player(
        &self,
        player_id: &str,
        force: bool,
    ) -> Result<Vec<Match>, SyncError> {
        self.matches.fetch(force).await?;
        Ok(self
            .matches_by_player
            .get(player_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    /// Window matches of one derived group, from the sub-cache.
    pub async fn matches_for_group(
        &self,
        group_id: &str,
        force: bool,
    ) -> Result<Vec<Match>, SyncError> {
        self.groups.fetch(force).await?;
        Ok(self.cached_matches_for_group(group_id))
    }

    /// Sub-cache read without any refresh trigger.
    pub fn cached_matches_for_group(&self, group_id: &str) -> Vec<Match> {
        self.matches_by_group
            .get(group_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Session lifecycle operations.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Drop every derived match sub-cache and mark the match and group
    /// snapshots stale. Called on any match mutation; precision is not
    /// worth the bookkeeping at this scale.
    pub async fn invalidate_match_caches(&self) {
        self.matches_by_game.clear();
        self.matches_by_player.clear();
        self.matches_by_group.clear();
        self.matches.invalidate().await;
        self.groups.invalidate().await;
    }

    /// Start the background task feeding store change notifications into
    /// the controllers. Session records are single-writer and uncached, so
    /// their signals are not consumed at all.
    pub fn spawn_invalidation_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = stream::select_all(vec![
            self.store.subscribe(EntityKind::Games, None),
            self.store.subscribe(EntityKind::Players, None),
            self.store.subscribe(EntityKind::Matches, None),
            self.store.subscribe(EntityKind::PlayerGroups, None),
        ]);

        let state = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                state.dispatch(event).await;
            }
            debug!("change stream closed; invalidation pump stopping");
        })
    }

    async fn dispatch(&self, event: ChangeEvent) {
        match event.entity {
            EntityKind::Games => match event.record_id.as_deref() {
                Some(record_id) => self.games.apply_point_update(record_id).await,
                None => self.games.schedule_refresh().await,
            },
            EntityKind::Players => match event.record_id.as_deref() {
                Some(record_id) => self.players.apply_point_update(record_id).await,
                None => self.players.schedule_refresh().await,
            },
            EntityKind::Matches => {
                self.invalidate_match_caches().await;
                self.matches.schedule_refresh().await;
                self.groups.schedule_refresh().await;
            }
            EntityKind::PlayerGroups => self.groups.schedule_refresh().await,
            EntityKind::Sessions => {}
        }
    }
}

fn collection_fetcher<T>(store: &SharedStore, root: &'static str) -> Fetcher<T>
where
    T: Identified + DeserializeOwned,
{
    let store = Arc::clone(store);
    Arc::new(move || {
        let store = Arc::clone(&store);
        async move {
            let value = store.get(root).await?;
            decode_collection(root, value)
        }
        .boxed()
    })
}

fn point_fetcher<T>(store: &SharedStore, record_path: fn(&str) -> String) -> PointFetcher<T>
where
    T: Identified + DeserializeOwned,
{
    let store = Arc::clone(store);
    Arc::new(move |record_id: String| {
        let store = Arc::clone(&store);
        async move {
            let path = record_path(&record_id);
            let value = store.get(&path).await?;
            decode_document(&path, value)
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde_json::json;
    use tokio::time::sleep;

    use super::*;
    use crate::{
        clock::manual::ManualClock,
        store::{RemoteStore, memory::MemoryStore},
    };

    fn base_time() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    async fn seed(store: &Arc<MemoryStore>) {
        store
            .set("games/g1", json!({"id": "g1", "title": "Chess", "supportedPlayerCounts": [2]}))
            .await
            .unwrap();
        store
            .set("players/a", json!({"id": "a", "name": "Alice"}))
            .await
            .unwrap();
        store
            .set("players/b", json!({"id": "b", "name": "Bob"}))
            .await
            .unwrap();
        store
            .set(
                "matches/m1",
                json!({
                    "id": "m1",
                    "gameID": "g1",
                    "date": date_value(base_time() - Duration::from_secs(3_600)),
                    "playerIDs": ["b", "a"],
                    "scores": [1, 0],
                    "winnerID": "b",
                    "playerIDsString": "a,b"
                }),
            )
            .await
            .unwrap();
    }

    fn date_value(at: SystemTime) -> serde_json::Value {
        serde_json::to_value(at).unwrap()
    }

    fn state(store: &Arc<MemoryStore>) -> SharedSync {
        SyncState::new(
            Arc::clone(store) as SharedStore,
            ManualClock::starting_at(base_time()),
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn top_level_fetch_populates_match_sub_caches() {
        let store = MemoryStore::new();
        seed(&store).await;
        let sync = state(&store);

        let games = sync.fetch_games(false).await.unwrap();
        assert_eq!(games.len(), 1);

        let for_game = sync.matches_for_game("g1", false).await.unwrap();
        assert_eq!(for_game.len(), 1);
        let for_alice = sync.matches_for_player("a", false).await.unwrap();
        assert_eq!(for_alice.len(), 1);
        assert!(sync.matches_for_player("nobody", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn group_refresh_upserts_and_fills_the_group_sub_cache() {
        let store = MemoryStore::new();
        seed(&store).await;
        let sync = state(&store);

        let groups = sync.fetch_player_groups(false).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "Alice & Bob");
        assert_eq!(groups[0].player_ids, ["a", "b"]);

        let group_matches = sync.matches_for_group(&groups[0].id, false).await.unwrap();
        assert_eq!(group_matches.len(), 1);
        assert_eq!(group_matches[0].id, "m1");

        // The group now exists in the store as well.
        let persisted = store.get(paths::PLAYER_GROUPS).await.unwrap().unwrap();
        assert_eq!(persisted.as_object().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn game_signal_point_merges_into_the_cache() {
        let store = MemoryStore::new();
        seed(&store).await;
        let sync = state(&store);
        sync.fetch_games(false).await.unwrap();

        let pump = sync.spawn_invalidation_pump();
        store
            .set("games/g2", json!({"id": "g2", "title": "Go", "supportedPlayerCounts": [2]}))
            .await
            .unwrap();

        sleep(Duration::from_secs(1)).await;
        let cached = sync.fetch_games(false).await.unwrap();
        assert_eq!(cached.len(), 2);
        pump.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn match_signal_clears_and_rebuilds_sub_caches() {
        let store = MemoryStore::new();
        seed(&store).await;
        let sync = state(&store);
        sync.fetch_matches(false).await.unwrap();
        assert_eq!(sync.matches_for_game("g1", false).await.unwrap().len(), 1);

        let pump = sync.spawn_invalidation_pump();
        store
            .set(
                "matches/m2",
                json!({
                    "id": "m2",
                    "gameID": "g1",
                    "date": date_value(base_time() - Duration::from_secs(60)),
                    "playerIDs": ["a", "b"],
                    "scores": [0, 1],
                    "winnerID": "a",
                    "playerIDsString": "a,b"
                }),
            )
            .await
            .unwrap();

        // Wait out the debounce window for the scheduled refresh.
        sleep(SyncConfig::default().cache.debounce * 2).await;
        assert_eq!(sync.matches_for_game("g1", false).await.unwrap().len(), 2);
        pump.abort();
    }
}
