//! Logical paths of the persisted layout, shared by all store backends.

/// Collection of game definitions.
pub const GAMES: &str = "games";
/// Collection of player profiles.
pub const PLAYERS: &str = "players";
/// Collection of recorded matches.
pub const MATCHES: &str = "matches";
/// Collection of derived player groups.
pub const PLAYER_GROUPS: &str = "playerGroups";
/// Collection of pairing session records.
pub const SESSIONS: &str = "sessions";
/// Secondary index mapping join codes to session ids.
pub const SESSIONS_BY_CODE: &str = "sessionsByCode";

/// Path of a single game record.
pub fn game(id: &str) -> String {
    format!("{GAMES}/{id}")
}

/// Path of a single player record.
pub fn player(id: &str) -> String {
    format!("{PLAYERS}/{id}")
}

/// Path of a single match record.
pub fn match_record(id: &str) -> String {
    format!("{MATCHES}/{id}")
}

/// Path of a single player-group record.
pub fn player_group(id: &str) -> String {
    format!("{PLAYER_GROUPS}/{id}")
}

/// Path of a single session record.
pub fn session(id: &str) -> String {
    format!("{SESSIONS}/{id}")
}

/// Path of the code-index entry for a join code.
pub fn session_by_code(code: &str) -> String {
    format!("{SESSIONS_BY_CODE}/{code}")
}
