//! Identifiers shared across the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ═══════════════════════════════════════════════════════════════════════════════
// TYPE ALIASES
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for one posted playback request
pub type PlayingId = u64;

/// Game object identifier (emitter)
pub type GameObjectId = u64;

/// Sample-accurate group identifier shared by voices that must start together
pub type SequenceId = u32;

/// Invalid game object (global scope)
pub const INVALID_GAME_OBJECT: GameObjectId = 0;

/// Invalid playing ID (for error cases)
pub const INVALID_PLAYING_ID: PlayingId = 0;

// ═══════════════════════════════════════════════════════════════════════════════
// NODE ID
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique ID of a playable node or bus, as authored in a bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NONE: Self = Self(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ID GENERATION
// ═══════════════════════════════════════════════════════════════════════════════

static NEXT_PLAYING_ID: AtomicU64 = AtomicU64::new(1);

/// Generate unique playing ID
#[inline]
pub fn generate_playing_id() -> PlayingId {
    NEXT_PLAYING_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playing_ids_are_unique() {
        let a = generate_playing_id();
        let b = generate_playing_id();
        assert_ne!(a, INVALID_PLAYING_ID);
        assert!(b > a);
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId(42).to_string(), "#42");
        assert!(NodeId::NONE.is_none());
    }
}
