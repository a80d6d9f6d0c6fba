use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use indexmap::IndexMap;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tracing::{debug, warn};

use crate::{
    clock::SharedClock,
    error::SyncError,
    store::{error::StoreError, models::Identified},
};

/// Fetcher producing the full collection snapshot for one entity family.
pub type Fetcher<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<T>, StoreError>> + Send + Sync>;

/// Fetcher producing a single record by id, `None` when it no longer exists.
pub type PointFetcher<T> =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Option<T>, StoreError>> + Send + Sync>;

/// Hook invoked with the fresh snapshot after every successful refresh, used
/// to populate derived sub-caches as a side effect of the top-level fetch.
pub type RefreshHook<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

/// Store failure shared between the coalesced waiters of one refresh.
#[derive(Clone)]
struct SharedStoreError(Arc<StoreError>);

impl fmt::Display for SharedStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<Arc<Vec<T>>, SharedStoreError>>>;

struct CacheInner<T> {
    entries: IndexMap<String, T>,
    last_refresh: Option<SystemTime>,
    inflight: Option<SharedFetch<T>>,
}

/// Cache coherency controller for one entity family.
///
/// Serves the freshest acceptable snapshot while minimizing round-trips:
/// snapshots younger than the TTL are served without I/O, concurrent
/// refreshes collapse into a single in-flight fetch whose result every
/// caller shares, and burst invalidation signals are absorbed by a
/// debounced timer that is cancelled and re-armed on each new signal.
/// An executing fetch is never cancelled by a newcomer.
pub struct CacheController<T: Identified> {
    name: &'static str,
    ttl: Duration,
    debounce: Duration,
    clock: SharedClock,
    fetcher: Fetcher<T>,
    point_fetcher: Option<PointFetcher<T>>,
    on_refresh: Option<RefreshHook<T>>,
    inner: Arc<Mutex<CacheInner<T>>>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Identified> CacheController<T> {
    /// Build a controller around a collection fetcher.
    pub fn new(
        name: &'static str,
        ttl: Duration,
        debounce: Duration,
        clock: SharedClock,
        fetcher: Fetcher<T>,
    ) -> Self {
        Self {
            name,
            ttl,
            debounce,
            clock,
            fetcher,
            point_fetcher: None,
            on_refresh: None,
            inner: Arc::new(Mutex::new(CacheInner {
                entries: IndexMap::new(),
                last_refresh: None,
                inflight: None,
            })),
            pending: Mutex::new(None),
        }
    }

    /// Enable point read-and-merge for record-scoped invalidation signals.
    pub fn with_point_fetcher(mut self, point_fetcher: PointFetcher<T>) -> Self {
        self.point_fetcher = Some(point_fetcher);
        self
    }

    /// Attach a hook run with every fresh snapshot.
    pub fn with_refresh_hook(mut self, on_refresh: RefreshHook<T>) -> Self {
        self.on_refresh = Some(on_refresh);
        self
    }

    /// Return the current snapshot, refreshing it when stale or forced.
    ///
    /// A failed refresh is swallowed and the last-known snapshot is served,
    /// unless the caller explicitly forced the refresh, in which case the
    /// failure propagates as [`SyncError::RefreshFailed`].
    pub async fn fetch(&self, force: bool) -> Result<Vec<T>, SyncError> {
        let shared = {
            let mut inner = self.inner.lock().await;
            if !force && self.is_fresh(&inner) {
                return Ok(inner.entries.values().cloned().collect());
            }
            self.refresh_handle(&mut inner)
        };

        match shared.await {
            Ok(snapshot) => Ok(snapshot.as_ref().clone()),
            Err(err) if force => Err(SyncError::RefreshFailed {
                message: err.to_string(),
            }),
            Err(_) => {
                // Stale-but-available beats an error surface.
                let inner = self.inner.lock().await;
                Ok(inner.entries.values().cloned().collect())
            }
        }
    }

    /// Snapshot currently held in cache, without any refresh trigger.
    pub async fn cached(&self) -> Vec<T> {
        let inner = self.inner.lock().await;
        inner.entries.values().cloned().collect()
    }

    /// Mark the snapshot stale so the next `fetch` refreshes it.
    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_refresh = None;
    }

    /// Schedule a debounced refresh, cancelling any pending timer.
    ///
    /// N signals inside the debounce window collapse into exactly one store
    /// fetch. Only the pending timer is replaced; a fetch that already
    /// started executing runs to completion.
    pub async fn schedule_refresh(self: &Arc<Self>) {
        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        let controller = Arc::clone(self);
        *pending = Some(tokio::spawn(async move {
            sleep(controller.debounce).await;
            if let Err(err) = controller.fetch(true).await {
                debug!(cache = controller.name, error = %err, "debounced refresh failed");
            }
        }));
    }

    /// React to a record-scoped invalidation signal.
    ///
    /// Families with a point fetcher read and merge just that record (an
    /// absent record evicts the cache entry); others fall back to a
    /// debounced collection refresh.
    pub async fn apply_point_update(self: &Arc<Self>, record_id: &str) {
        let Some(point_fetcher) = self.point_fetcher.clone() else {
            self.schedule_refresh().await;
            return;
        };

        match point_fetcher(record_id.to_string()).await {
            Ok(Some(record)) => {
                let mut inner = self.inner.lock().await;
                inner.entries.insert(record.id().to_string(), record);
                debug!(cache = self.name, record = record_id, "merged point update");
            }
            Ok(None) => {
                let mut inner = self.inner.lock().await;
                inner.entries.shift_remove(record_id);
                debug!(cache = self.name, record = record_id, "evicted deleted record");
            }
            Err(err) => {
                warn!(
                    cache = self.name,
                    record = record_id,
                    error = %err,
                    "point read failed; scheduling full refresh"
                );
                self.schedule_refresh().await;
            }
        }
    }

    fn is_fresh(&self, inner: &CacheInner<T>) -> bool {
        inner.last_refresh.is_some_and(|at| {
            self.clock
                .now()
                .duration_since(at)
                .is_ok_and(|age| age < self.ttl)
        })
    }

    /// Return the in-flight fetch, starting one if none is running.
    fn refresh_handle(&self, inner: &mut CacheInner<T>) -> SharedFetch<T> {
        if let Some(inflight) = &inner.inflight {
            return inflight.clone();
        }

        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.inner);
        let clock = Arc::clone(&self.clock);
        let on_refresh = self.on_refresh.clone();
        let name = self.name;

        let shared = async move {
            let outcome = fetcher().await;
            let mut inner = cache.lock().await;
            inner.inflight = None;
            match outcome {
                Ok(snapshot) => {
                    merge_snapshot(&mut inner.entries, &snapshot);
                    inner.last_refresh = Some(clock.now());
                    debug!(cache = name, count = snapshot.len(), "cache refreshed");
                    if let Some(on_refresh) = &on_refresh {
                        on_refresh(&snapshot);
                    }
                    Ok(Arc::new(snapshot))
                }
                Err(err) => {
                    warn!(cache = name, error = %err, "refresh failed; keeping stale snapshot");
                    Err(SharedStoreError(Arc::new(err)))
                }
            }
        }
        .boxed()
        .shared();

        inner.inflight = Some(shared.clone());
        shared
    }
}

/// Replace the cache contents with the fresh snapshot: entries are upserted
/// by id and ids absent from the result set are evicted.
fn merge_snapshot<T: Identified>(entries: &mut IndexMap<String, T>, snapshot: &[T]) {
    let fresh_ids: HashSet<&str> = snapshot.iter().map(Identified::id).collect();
    entries.retain(|id, _| fresh_ids.contains(id.as_str()));
    for record in snapshot {
        entries.insert(record.id().to_string(), record.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{clock::manual::ManualClock, store::models::Player};

    const TTL: Duration = Duration::from_secs(30);
    const DEBOUNCE: Duration = Duration::from_secs(2);

    fn player(id: &str, name: &str) -> Player {
        Player {
            id: id.into(),
            name: name.into(),
            owner_id: None,
            photo_url: None,
        }
    }

    struct Backend {
        calls: AtomicUsize,
        failing: AtomicBool,
        delay: Option<Duration>,
    }

    impl Backend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                delay: Some(delay),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn fetcher(self: &Arc<Self>) -> Fetcher<Player> {
            let backend = Arc::clone(self);
            Arc::new(move || {
                let backend = Arc::clone(&backend);
                async move {
                    backend.calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(delay) = backend.delay {
                        sleep(delay).await;
                    }
                    if backend.failing.load(Ordering::SeqCst) {
                        return Err(StoreError::unavailable(
                            "backend down",
                            io::Error::new(io::ErrorKind::NotConnected, "down"),
                        ));
                    }
                    Ok(vec![player("p1", "Alice"), player("p2", "Bob")])
                }
                .boxed()
            })
        }
    }

    fn controller(backend: &Arc<Backend>, clock: Arc<ManualClock>) -> Arc<CacheController<Player>> {
        Arc::new(CacheController::new(
            "players",
            TTL,
            DEBOUNCE,
            clock,
            backend.fetcher(),
        ))
    }

    #[tokio::test]
    async fn fresh_snapshot_is_served_without_io() {
        let backend = Backend::new();
        let cache = controller(&backend, ManualClock::fixed());

        let first = cache.fetch(false).await.unwrap();
        let second = cache.fetch(false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn expired_ttl_triggers_a_new_read() {
        let backend = Backend::new();
        let clock = ManualClock::fixed();
        let cache = controller(&backend, Arc::clone(&clock));

        cache.fetch(false).await.unwrap();
        clock.advance(TTL + Duration::from_millis(1));
        cache.fetch(false).await.unwrap();

        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn force_refresh_ignores_ttl() {
        let backend = Backend::new();
        let cache = controller(&backend, ManualClock::fixed());

        cache.fetch(false).await.unwrap();
        cache.fetch(true).await.unwrap();
        cache.fetch(true).await.unwrap();

        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_inflight_fetch() {
        let backend = Backend::slow(Duration::from_millis(50));
        let cache = controller(&backend, ManualClock::fixed());

        let (a, b, c) = tokio::join!(cache.fetch(true), cache.fetch(true), cache.fetch(false));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(backend.calls(), 1);
        assert_eq!(c.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_signals_collapses_into_one_fetch() {
        let backend = Backend::new();
        let cache = controller(&backend, ManualClock::fixed());

        cache.schedule_refresh().await;
        cache.schedule_refresh().await;
        cache.schedule_refresh().await;

        sleep(DEBOUNCE * 2).await;
        assert_eq!(backend.calls(), 1);
        assert_eq!(cache.cached().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn new_signal_rearms_the_pending_timer() {
        let backend = Backend::new();
        let cache = controller(&backend, ManualClock::fixed());

        cache.schedule_refresh().await;
        sleep(DEBOUNCE / 2).await;
        // Still inside the quiet window: the first timer must be replaced.
        cache.schedule_refresh().await;
        sleep(DEBOUNCE / 2).await;
        assert_eq!(backend.calls(), 0);

        sleep(DEBOUNCE).await;
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn failed_background_refresh_serves_stale_snapshot() {
        let backend = Backend::new();
        let clock = ManualClock::fixed();
        let cache = controller(&backend, Arc::clone(&clock));

        let fresh = cache.fetch(false).await.unwrap();
        backend.failing.store(true, Ordering::SeqCst);
        clock.advance(TTL + Duration::from_secs(1));

        let stale = cache.fetch(false).await.unwrap();
        assert_eq!(fresh, stale);
    }

    #[tokio::test]
    async fn failed_force_refresh_propagates() {
        let backend = Backend::new();
        let cache = controller(&backend, ManualClock::fixed());

        cache.fetch(false).await.unwrap();
        backend.failing.store(true, Ordering::SeqCst);

        let err = cache.fetch(true).await.unwrap_err();
        assert!(matches!(err, SyncError::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn refresh_evicts_ids_missing_from_the_result_set() {
        let backend = Backend::new();
        let clock = ManualClock::fixed();
        let cache = controller(&backend, Arc::clone(&clock));

        {
            let mut inner = cache.inner.lock().await;
            inner
                .entries
                .insert("ghost".into(), player("ghost", "Gone"));
        }

        let snapshot = cache.fetch(true).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|p| p.id != "ghost"));
    }

    #[tokio::test]
    async fn point_update_merges_and_evicts() {
        let backend = Backend::new();
        let gone = Arc::new(AtomicBool::new(false));
        let gone_flag = Arc::clone(&gone);
        let point: PointFetcher<Player> = Arc::new(move |id: String| {
            let gone = Arc::clone(&gone_flag);
            async move {
                if gone.load(Ordering::SeqCst) {
                    Ok(None)
                } else {
                    Ok(Some(player(&id, "Renamed")))
                }
            }
            .boxed()
        });
        let cache = Arc::new(
            CacheController::new(
                "players",
                TTL,
                DEBOUNCE,
                ManualClock::fixed(),
                backend.fetcher(),
            )
            .with_point_fetcher(point),
        );

        cache.fetch(false).await.unwrap();
        cache.apply_point_update("p1").await;
        let snapshot = cache.cached().await;
        let renamed = snapshot.iter().find(|p| p.id == "p1").unwrap();
        assert_eq!(renamed.name, "Renamed");
        assert_eq!(backend.calls(), 1);

        gone.store(true, Ordering::SeqCst);
        cache.apply_point_update("p1").await;
        assert!(cache.cached().await.iter().all(|p| p.id != "p1"));
    }

    #[tokio::test]
    async fn refresh_hook_sees_every_fresh_snapshot() {
        let backend = Backend::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_hook = Arc::clone(&seen);
        let hook: RefreshHook<Player> = Arc::new(move |snapshot: &[Player]| {
            seen_hook.fetch_add(snapshot.len(), Ordering::SeqCst);
        });
        let cache = Arc::new(
            CacheController::new(
                "players",
                TTL,
                DEBOUNCE,
                ManualClock::fixed(),
                backend.fetcher(),
            )
            .with_refresh_hook(hook),
        );

        cache.fetch(false).await.unwrap();
        cache.fetch(true).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
