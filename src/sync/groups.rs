use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::store::{
    SharedStore,
    error::StoreError,
    models::{Match, Player, PlayerGroup, decode_collection, encode_document},
    paths,
};

/// Display name of a group without any members.
const EMPTY_GROUP_NAME: &str = "No players";

/// Candidate group produced by one derivation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBucket {
    /// Sorted, de-duplicated member ids; the bucket's identity.
    pub player_ids: Vec<String>,
    /// Display name synthesized from the members' names.
    pub name: String,
    /// Matches in the window played by exactly this set of players.
    pub matches: Vec<Match>,
}

/// Stateless transform reconstructing player groups from match history.
///
/// Group identity is strict set-equality on player ids: order never
/// matters, and `{A,B}` and `{A,B,C}` are different groups.
pub struct GroupDeriver {
    window: Duration,
}

impl GroupDeriver {
    /// Deriver considering matches played within `window` of "now".
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Bucket recent matches by their unordered player-ID set.
    pub fn derive(&self, now: SystemTime, matches: &[Match], players: &[Player]) -> Vec<GroupBucket> {
        let cutoff = now.checked_sub(self.window);
        let names: HashMap<&str, &str> = players
            .iter()
            .map(|player| (player.id.as_str(), player.name.as_str()))
            .collect();

        let mut buckets: IndexMap<String, GroupBucket> = IndexMap::new();
        for record in matches {
            if let Some(cutoff) = cutoff {
                if record.date < cutoff {
                    continue;
                }
            }
            let player_ids = Match::canonical_player_ids(&record.player_ids);
            let key = player_ids.join(",");
            buckets
                .entry(key)
                .or_insert_with(|| GroupBucket {
                    name: display_name(&player_ids, &names),
                    player_ids,
                    matches: Vec::new(),
                })
                .matches
                .push(record.clone());
        }
        buckets.into_values().collect()
    }
}

/// Synthesize a group display name from its members' names, sorted.
///
/// Unknown member ids fall back to the raw id so a group never loses a seat
/// just because a player record lagged behind a match record.
fn display_name(player_ids: &[String], names: &HashMap<&str, &str>) -> String {
    let mut members: Vec<&str> = player_ids
        .iter()
        .map(|id| names.get(id.as_str()).copied().unwrap_or(id.as_str()))
        .collect();
    members.sort_unstable();

    match members.as_slice() {
        [] => EMPTY_GROUP_NAME.to_string(),
        [only] => (*only).to_string(),
        [first, second] => format!("{first} & {second}"),
        [head @ .., last] => format!("{}, & {last}", head.join(", ")),
    }
}

/// Outcome of one group synchronization pass.
#[derive(Debug, Clone)]
pub struct GroupSync {
    /// Groups present in the recency window, persisted ids attached.
    pub groups: Vec<PlayerGroup>,
    /// Window matches keyed by the group id they belong to.
    pub matches_by_group: HashMap<String, Vec<Match>>,
}

/// Run a derivation pass and reconcile it with the persisted groups.
///
/// A bucket reuses the existing group with an equal player-ID set (renaming
/// it when the computed name drifted, e.g. after a player rename) and a new
/// group is pushed otherwise. Groups that fell out of the window are left
/// persisted but not returned.
pub async fn sync_groups(
    store: &SharedStore,
    deriver: &GroupDeriver,
    now: SystemTime,
    matches: &[Match],
    players: &[Player],
) -> Result<GroupSync, StoreError> {
    let existing = store.get(paths::PLAYER_GROUPS).await?;
    let existing: Vec<PlayerGroup> = decode_collection(paths::PLAYER_GROUPS, existing)?;
    let mut by_members: HashMap<String, PlayerGroup> = existing
        .into_iter()
        .map(|group| (group.member_key(), group))
        .collect();

    let mut groups = Vec::new();
    let mut matches_by_group = HashMap::new();

    for bucket in deriver.derive(now, matches, players) {
        let key = bucket.player_ids.join(",");
        let group = match by_members.remove(&key) {
            Some(mut group) => {
                if group.name != bucket.name {
                    let path = paths::player_group(&group.id);
                    let mut partial = Map::new();
                    partial.insert("name".into(), Value::String(bucket.name.clone()));
                    store.update(&path, partial).await?;
                    debug!(group = %group.id, name = %bucket.name, "renamed player group");
                    group.name = bucket.name.clone();
                }
                group
            }
            None => {
                let id = store.push(paths::PLAYER_GROUPS).await?;
                let group = PlayerGroup {
                    id: id.clone(),
                    name: bucket.name.clone(),
                    player_ids: bucket.player_ids.clone(),
                };
                let path = paths::player_group(&id);
                store.set(&path, encode_document(&path, &group)?).await?;
                debug!(group = %id, members = bucket.player_ids.len(), "created player group");
                group
            }
        };

        matches_by_group.insert(group.id.clone(), bucket.matches);
        groups.push(group);
    }

    Ok(GroupSync {
        groups,
        matches_by_group,
    })
}
