use std::time::SystemTime;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::store::error::{StoreError, StoreResult};

/// Entity exposing the stable identifier caches key on.
pub trait Identified: Clone + Send + Sync + 'static {
    /// Stable record id.
    fn id(&self) -> &str;
}

/// Game definition shared by every match of that game.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Game {
    /// Primary key, immutable once created.
    pub id: String,
    /// Display title of the game.
    pub title: String,
    /// Whether the game only records win/lose instead of numeric scores.
    #[serde(rename = "isBinaryScore", default)]
    pub is_binary_score: bool,
    /// Player counts a match of this game may have (non-empty, each >= 1).
    #[serde(rename = "supportedPlayerCounts")]
    pub supported_player_counts: Vec<u32>,
}

impl Game {
    /// Whether a match with `count` players fits this game's configuration.
    ///
    /// Advisory only: the constraint is not enforced at write time.
    pub fn supports_player_count(&self, count: usize) -> bool {
        u32::try_from(count).is_ok_and(|count| self.supported_player_counts.contains(&count))
    }
}

/// Player profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Player {
    /// Primary key.
    pub id: String,
    /// Display name, non-empty.
    pub name: String,
    /// Identity that owns this player profile, when claimed.
    #[serde(rename = "ownerID", skip_serializing_if = "Option::is_none", default)]
    pub owner_id: Option<String>,
    /// URL of the player's photo, when one was uploaded.
    #[serde(rename = "photoURL", skip_serializing_if = "Option::is_none", default)]
    pub photo_url: Option<String>,
}

/// Recorded match of one game.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Match {
    /// Primary key.
    pub id: String,
    /// Game this match belongs to.
    #[serde(rename = "gameID")]
    pub game_id: String,
    /// When the match was played.
    pub date: SystemTime,
    /// Participants in play order; non-empty, no duplicates.
    #[serde(rename = "playerIDs")]
    pub player_ids: Vec<String>,
    /// Scores aligned with `player_ids`.
    #[serde(default)]
    pub scores: Vec<i32>,
    /// Winner, when one was recorded; always a member of `player_ids`.
    #[serde(rename = "winnerID", skip_serializing_if = "Option::is_none", default)]
    pub winner_id: Option<String>,
    /// Sorted, comma-joined participant ids kept alongside the raw list so
    /// the store can answer set-equality queries.
    #[serde(rename = "playerIDsString", default)]
    pub player_ids_string: String,
}

impl Match {
    /// Canonical form of a participant set: sorted, de-duplicated ids.
    pub fn canonical_player_ids(player_ids: &[String]) -> Vec<String> {
        let mut ids = player_ids.to_vec();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Set-identity key for this match's participants.
    pub fn player_set_key(&self) -> String {
        Self::canonical_player_ids(&self.player_ids).join(",")
    }
}

/// Derived aggregate of players who appear together in match history.
///
/// The surrogate id is not stable across derivation passes; two groups are
/// the same group iff their participant sets are equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerGroup {
    /// Surrogate key assigned by the store at creation.
    pub id: String,
    /// Display name derived from the members' names.
    pub name: String,
    /// Sorted, de-duplicated member ids; the group's real identity.
    #[serde(rename = "playerIDs")]
    pub player_ids: Vec<String>,
}

impl PlayerGroup {
    /// Set-identity key of this group's members.
    pub fn member_key(&self) -> String {
        Match::canonical_player_ids(&self.player_ids).join(",")
    }
}

/// Ephemeral pairing session addressed by a short join code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Primary key assigned by the store at creation.
    pub id: String,
    /// Six-character upper-alphanumeric join code.
    pub code: String,
    /// Participants, set semantics; the record is deleted when this empties.
    #[serde(rename = "participantIDs", default)]
    pub participant_ids: Vec<String>,
    /// Creation timestamp.
    #[serde(rename = "createdAt")]
    pub created_at: SystemTime,
    /// Player that created the session.
    #[serde(rename = "createdByID")]
    pub created_by_id: String,
    /// Game the session was opened for, when known up front.
    #[serde(rename = "gameID", skip_serializing_if = "Option::is_none", default)]
    pub game_id: Option<String>,
    /// Bumped on every join/leave; drives the inactivity expiry.
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: SystemTime,
}

impl Identified for Game {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for Player {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for Match {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for PlayerGroup {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Decode a collection subtree (id-keyed JSON object) into entities.
///
/// An absent subtree decodes to an empty collection; scalar junk at the
/// collection root is a malformed document.
pub fn decode_collection<T: DeserializeOwned>(path: &str, value: Option<Value>) -> StoreResult<Vec<T>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let Value::Object(children) = value else {
        return Err(StoreError::malformed(
            path,
            serde::de::Error::custom("expected an id-keyed object"),
        ));
    };
    children
        .into_iter()
        .map(|(id, child)| {
            serde_json::from_value(child)
                .map_err(|source| StoreError::malformed(format!("{path}/{id}"), source))
        })
        .collect()
}

/// Decode a single document, `None` when absent.
pub fn decode_document<T: DeserializeOwned>(path: &str, value: Option<Value>) -> StoreResult<Option<T>> {
    value
        .map(|value| {
            serde_json::from_value(value).map_err(|source| StoreError::malformed(path, source))
        })
        .transpose()
}

/// Encode an entity into the JSON value stored at `path`.
pub fn encode_document<T: Serialize>(path: &str, entity: &T) -> StoreResult<Value> {
    serde_json::to_value(entity).map_err(|source| StoreError::malformed(path, source))
}
