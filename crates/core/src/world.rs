//! World-level metadata sent ahead of a bulk transfer.

use serde::{Deserialize, Serialize};

/// Game difficulty the host is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Difficulty {
    /// Relaxed.
    Casual = 0,
    /// Default rules.
    #[default]
    Normal = 1,
    /// Stronger enemies.
    Expert = 2,
    /// Hardest setting.
    Master = 3,
}

/// Text attached to a sign tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sign {
    /// Column of the sign tile.
    pub x: i32,
    /// Row of the sign tile.
    pub y: i32,
    /// Sign text.
    pub text: String,
}

/// Everything a joining peer needs besides the tiles themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldMetadata {
    /// World name.
    pub name: String,
    /// Difficulty.
    pub difficulty: Difficulty,
    /// Width in tiles.
    pub width: u32,
    /// Height in tiles.
    pub height: u32,
    /// Player spawn tile.
    pub spawn: (i32, i32),
    /// Sign texts.
    pub signs: Vec<Sign>,
    /// Number of chunks the transfer will carry, fixed before the first chunk.
    pub total_chunks: u32,
    /// Number of stored tiles across all layers.
    pub tile_count: u64,
    /// [`crate::TileMap::checksum`] of the world being sent.
    pub checksum: u32,
}

impl WorldMetadata {
    /// Metadata for a world that has not been partitioned yet.
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            difficulty: Difficulty::default(),
            width,
            height,
            spawn: ((width / 2) as i32, 0),
            signs: Vec::new(),
            total_chunks: 0,
            tile_count: 0,
            checksum: 0,
        }
    }

    /// Whether a tile coordinate lies inside the world bounds.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }
}
