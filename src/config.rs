//! Runtime tunables for cache freshness, debounce windows, and session expiry.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the library looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/sync.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "TALLY_SYNC_CONFIG_PATH";

/// Immutable runtime configuration shared across the synchronization layer.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Cache freshness tunables.
    pub cache: CacheConfig,
    /// Pairing session tunables.
    pub session: SessionConfig,
}

/// Freshness and coalescing windows for the cache controllers.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL of the games snapshot.
    pub games_ttl: Duration,
    /// TTL of the players snapshot.
    pub players_ttl: Duration,
    /// TTL of the matches snapshot.
    pub matches_ttl: Duration,
    /// TTL of the derived-groups snapshot.
    pub groups_ttl: Duration,
    /// Quiet interval a burst of refresh triggers collapses into.
    pub debounce: Duration,
    /// Recency window of match history the group derivation consumes.
    pub group_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            games_ttl: Duration::from_secs(30),
            players_ttl: Duration::from_secs(2),
            matches_ttl: Duration::from_secs(30),
            groups_ttl: Duration::from_secs(30),
            debounce: Duration::from_secs(2),
            group_window: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Lifecycle tunables for pairing sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inactivity span after which a session counts as expired.
    pub ttl: Duration,
    /// Number of characters in a join code.
    pub code_length: usize,
    /// Draws attempted before code generation gives up.
    pub code_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            code_length: 6,
            code_attempts: 10,
        }
    }
}

impl SyncConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(path = %path.display(), "loaded sync configuration");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

/// JSON representation of the configuration file; every field is optional
/// and missing values keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawConfig {
    cache: RawCacheConfig,
    session: RawSessionConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawCacheConfig {
    games_ttl_secs: Option<u64>,
    players_ttl_secs: Option<u64>,
    matches_ttl_secs: Option<u64>,
    groups_ttl_secs: Option<u64>,
    debounce_ms: Option<u64>,
    group_window_days: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawSessionConfig {
    ttl_hours: Option<u64>,
    code_length: Option<usize>,
    code_attempts: Option<u32>,
}

impl From<RawConfig> for SyncConfig {
    fn from(raw: RawConfig) -> Self {
        let cache_defaults = CacheConfig::default();
        let session_defaults = SessionConfig::default();
        Self {
            cache: CacheConfig {
                games_ttl: raw
                    .cache
                    .games_ttl_secs
                    .map_or(cache_defaults.games_ttl, Duration::from_secs),
                players_ttl: raw
                    .cache
                    .players_ttl_secs
                    .map_or(cache_defaults.players_ttl, Duration::from_secs),
                matches_ttl: raw
                    .cache
                    .matches_ttl_secs
                    .map_or(cache_defaults.matches_ttl, Duration::from_secs),
                groups_ttl: raw
                    .cache
                    .groups_ttl_secs
                    .map_or(cache_defaults.groups_ttl, Duration::from_secs),
                debounce: raw
                    .cache
                    .debounce_ms
                    .map_or(cache_defaults.debounce, Duration::from_millis),
                group_window: raw.cache.group_window_days.map_or(
                    cache_defaults.group_window,
                    |days| Duration::from_secs(days * 24 * 60 * 60),
                ),
            },
            session: SessionConfig {
                ttl: raw.session.ttl_hours.map_or(session_defaults.ttl, |hours| {
                    Duration::from_secs(hours * 60 * 60)
                }),
                code_length: raw.session.code_length.unwrap_or(session_defaults.code_length),
                code_attempts: raw
                    .session
                    .code_attempts
                    .unwrap_or(session_defaults.code_attempts),
            },
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
