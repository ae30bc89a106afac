//! Subject and key naming for the NATS backend.
//!
//! Game ids are opaque, so they are URL-safe base64 encoded before use as a
//! subject token or KV key. The encoded alphabet (`A-Z a-z 0-9 - _`) is valid
//! in both places and never contains the `.` separator.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::common::GameId;
use crate::domains::game::Role;

pub fn encode_game_id(game_id: &GameId) -> String {
    URL_SAFE_NO_PAD.encode(game_id.as_str().as_bytes())
}

/// Pub/sub subject for one game: `{prefix}.{encoded id}`.
pub fn channel_subject(prefix: &str, game_id: &GameId) -> String {
    format!("{}.{}", prefix, encode_game_id(game_id))
}

/// Snapshot bucket key for one game.
pub fn snapshot_key(game_id: &GameId) -> String {
    encode_game_id(game_id)
}

/// Claims bucket key for one role of one game: `{encoded id}.{role}`.
pub fn claim_key(game_id: &GameId, role: Role) -> String {
    format!("{}.{}", encode_game_id(game_id), role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::game::Mark;

    fn is_valid_kv_key(key: &str) -> bool {
        !key.is_empty()
            && !key.starts_with('.')
            && !key.ends_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-/_=.".contains(c))
    }

    #[test]
    fn test_keys_are_valid_for_arbitrary_game_ids() {
        for raw in ["g1", "room 42", "a.b.c", "*>", "ünï/cödé"] {
            let id = GameId::parse(raw).unwrap();
            assert!(is_valid_kv_key(&snapshot_key(&id)), "{}", raw);
            assert!(is_valid_kv_key(&claim_key(&id, Mark::X)), "{}", raw);
            assert!(!encode_game_id(&id).contains('.'));
        }
    }

    #[test]
    fn test_distinct_ids_never_share_keys() {
        let a = GameId::parse("a.b").unwrap();
        let b = GameId::parse("a_b").unwrap();
        assert_ne!(snapshot_key(&a), snapshot_key(&b));
    }

    #[test]
    fn test_subject_and_claim_layout() {
        let id = GameId::parse("g1").unwrap();
        assert_eq!(channel_subject("games", &id), "games.ZzE");
        assert_eq!(claim_key(&id, Mark::O), "ZzE.O");
    }
}
