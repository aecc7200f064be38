//! Seeded demo world used by `host` and `loopback`.

use rand::{rngs::StdRng, Rng, SeedableRng};
use tilesync_core::{Sign, TileKey, TileLayer, TileMap, TileState, WorldMetadata};

pub const DIRT: u16 = 1;
pub const STONE: u16 = 2;
pub const GRASS: u16 = 3;
pub const WATER: u16 = 10;
pub const CHEST: u16 = 20;
pub const SIGN: u16 = 21;

/// Rolling terrain with a few ponds, chests and one welcome sign.
pub fn generate(name: &str, width: u32, height: u32, seed: u64) -> (WorldMetadata, TileMap) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tiles = TileMap::new();
    let (w, h) = (width as i32, height as i32);

    let mut surface = h / 2;
    let mut heights = Vec::with_capacity(width as usize);
    for x in 0..w {
        surface = (surface + rng.gen_range(-1..=1)).clamp(h / 4, h * 3 / 4);
        heights.push(surface);
        for y in surface..h {
            let block = match y - surface {
                0 => GRASS,
                1..=3 => DIRT,
                _ => STONE,
            };
            tiles.set(TileKey::new(x, y, TileLayer::Ground), TileState::new(block));
        }
    }

    // Water pools in local dips, one row deep.
    for x in 1..w.saturating_sub(1) {
        let y = heights[x as usize];
        if y > heights[(x - 1) as usize] && y > heights[(x + 1) as usize] {
            tiles.set(
                TileKey::new(x, y - 1, TileLayer::Liquid),
                TileState::with_data(WATER, vec![255]),
            );
        }
    }

    let mut signs = Vec::new();
    if w > 0 {
        let chests = (w / 16).max(1);
        for _ in 0..chests {
            let x = rng.gen_range(0..w);
            let y = heights[x as usize] - 1;
            let loot: u8 = rng.gen_range(1..=9);
            tiles.set(
                TileKey::new(x, y, TileLayer::Furniture),
                TileState::with_data(CHEST, vec![loot]),
            );
        }

        let x = w / 2;
        let y = heights[x as usize] - 1;
        tiles.set(TileKey::new(x, y, TileLayer::Furniture), TileState::new(SIGN));
        signs.push(Sign {
            x,
            y,
            text: format!("Welcome to {name}"),
        });
    }

    let mut metadata = WorldMetadata::new(name, width, height);
    metadata.spawn = (w / 2, heights.get((w / 2) as usize).copied().unwrap_or(0) - 1);
    metadata.signs = signs;
    (metadata, tiles)
}
