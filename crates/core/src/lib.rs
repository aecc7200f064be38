#![warn(missing_docs)]
//! Core data model shared by the replication core, the test harness and the binary.

pub mod entity;
pub mod ids;
pub mod tile;
pub mod world;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use entity::{
    EntityFlags, ExtraError, ExtraFields, ExtraKey, ExtraValue, ExtraValueKind,
    NetworkEntitySnapshot, Vec2, EXTRA_SCHEMA_VERSION, MAX_EXTRA_FIELDS,
};
pub use ids::{NetworkId, NetworkIdError};
pub use tile::{TileKey, TileLayer, TileMap, TilePos, TileState, AIR};
pub use world::{Difficulty, Sign, WorldMetadata};

/// Fixed tick counter driving the network loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick of any session.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

/// Stable identity of a participant, issued by the platform identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Sentinel used when an edit has no acting player (e.g. world generation).
    pub const NONE: Self = Self(0);

    /// Whether this is the "no player" sentinel.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}
