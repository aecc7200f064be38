//! Sparse tile storage.
//!
//! The world is three independent layers of sparse cells. A missing entry is
//! air; air is never stored, so `set` with block id 0 removes the key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Block id of air.
pub const AIR: u16 = 0;

/// World layer a tile lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TileLayer {
    /// Solid terrain.
    Ground = 0,
    /// Water, lava and other fluids.
    Liquid = 1,
    /// Placed furniture and multi-cell objects.
    Furniture = 2,
}

impl TileLayer {
    /// All layers in transfer order.
    pub const ALL: [TileLayer; 3] = [TileLayer::Ground, TileLayer::Liquid, TileLayer::Furniture];

    /// Stable numeric representation.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the stable numeric representation.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ground),
            1 => Some(Self::Liquid),
            2 => Some(Self::Furniture),
            _ => None,
        }
    }

    /// Lowercase name for logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ground => "ground",
            Self::Liquid => "liquid",
            Self::Furniture => "furniture",
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

/// Cell coordinates within a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TilePos {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl TilePos {
    /// Construct a position.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Fully qualified address of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
    /// Layer.
    pub layer: TileLayer,
}

impl TileKey {
    /// Construct a key.
    pub const fn new(x: i32, y: i32, layer: TileLayer) -> Self {
        Self { x, y, layer }
    }

    /// Position part of the key.
    pub const fn pos(self) -> TilePos {
        TilePos::new(self.x, self.y)
    }

    /// Rebuild a key from a layer and position.
    pub const fn from_pos(layer: TileLayer, pos: TilePos) -> Self {
        Self::new(pos.x, pos.y, layer)
    }
}

/// Identity and instance data of a non-air tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileState {
    /// Block type id. Zero means air.
    pub block_id: u16,
    /// Per-instance state (flow level, rotation, inventory handle...).
    pub instance_data: Vec<u8>,
}

impl TileState {
    /// A tile with no instance data.
    pub fn new(block_id: u16) -> Self {
        Self {
            block_id,
            instance_data: Vec::new(),
        }
    }

    /// A tile carrying instance data.
    pub fn with_data(block_id: u16, instance_data: Vec<u8>) -> Self {
        Self {
            block_id,
            instance_data,
        }
    }

    /// The air state (only ever used transiently to express removal).
    pub fn air() -> Self {
        Self::new(AIR)
    }

    /// Whether this is air.
    pub fn is_air(&self) -> bool {
        self.block_id == AIR
    }
}

/// Sparse three-layer tile map with deterministic iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileMap {
    layers: [BTreeMap<TilePos, TileState>; 3],
}

impl TileMap {
    /// Create an empty (all air) map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a tile. `None` means air.
    pub fn get(&self, key: TileKey) -> Option<&TileState> {
        self.layers[key.layer.slot()].get(&key.pos())
    }

    /// The tile at `key`, materializing air for absent keys.
    pub fn get_or_air(&self, key: TileKey) -> TileState {
        self.get(key).cloned().unwrap_or_else(TileState::air)
    }

    /// Whether a non-air tile is stored at `key`.
    pub fn contains_key(&self, key: TileKey) -> bool {
        self.layers[key.layer.slot()].contains_key(&key.pos())
    }

    /// Set a tile, returning the previous state. Air removes the key.
    pub fn set(&mut self, key: TileKey, state: TileState) -> Option<TileState> {
        let layer = &mut self.layers[key.layer.slot()];
        if state.is_air() {
            layer.remove(&key.pos())
        } else {
            layer.insert(key.pos(), state)
        }
    }

    /// Remove a tile (set it to air).
    pub fn remove(&mut self, key: TileKey) -> Option<TileState> {
        self.layers[key.layer.slot()].remove(&key.pos())
    }

    /// Total stored (non-air) tiles across layers.
    pub fn len(&self) -> usize {
        self.layers.iter().map(BTreeMap::len).sum()
    }

    /// Whether every cell is air.
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(BTreeMap::is_empty)
    }

    /// Stored tiles on one layer.
    pub fn layer_len(&self, layer: TileLayer) -> usize {
        self.layers[layer.slot()].len()
    }

    /// Iterate one layer in position order.
    pub fn iter_layer(&self, layer: TileLayer) -> impl Iterator<Item = (&TilePos, &TileState)> {
        self.layers[layer.slot()].iter()
    }

    /// Iterate all tiles, layer by layer.
    pub fn iter(&self) -> impl Iterator<Item = (TileKey, &TileState)> {
        TileLayer::ALL.into_iter().flat_map(move |layer| {
            self.layers[layer.slot()]
                .iter()
                .map(move |(pos, state)| (TileKey::from_pos(layer, *pos), state))
        })
    }

    /// CRC32 over every stored tile in iteration order.
    ///
    /// Two maps with the same contents always produce the same checksum,
    /// regardless of insertion order.
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for (key, state) in self.iter() {
            hasher.update(&[key.layer.as_u8()]);
            hasher.update(&key.x.to_le_bytes());
            hasher.update(&key.y.to_le_bytes());
            hasher.update(&state.block_id.to_le_bytes());
            hasher.update(&(state.instance_data.len() as u32).to_le_bytes());
            hasher.update(&state.instance_data);
        }
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_ids_are_stable() {
        assert_eq!(TileLayer::Ground.as_u8(), 0);
        assert_eq!(TileLayer::Liquid.as_u8(), 1);
        assert_eq!(TileLayer::Furniture.as_u8(), 2);
        assert_eq!(TileLayer::from_u8(2), Some(TileLayer::Furniture));
        assert_eq!(TileLayer::from_u8(3), None);
    }

    #[test]
    fn air_is_never_stored() {
        let mut map = TileMap::new();
        let key = TileKey::new(4, 9, TileLayer::Ground);

        map.set(key, TileState::new(3));
        assert!(map.contains_key(key));

        map.set(key, TileState::air());
        assert!(!map.contains_key(key));
        assert_eq!(map.len(), 0);

        // Writing air over air is a no-op, not a stored zero.
        assert_eq!(map.set(key, TileState::with_data(0, vec![1, 2])), None);
        assert!(!map.contains_key(key));
    }

    #[test]
    fn layers_are_independent() {
        let mut map = TileMap::new();
        map.set(TileKey::new(1, 1, TileLayer::Ground), TileState::new(1));
        map.set(TileKey::new(1, 1, TileLayer::Liquid), TileState::with_data(7, vec![255]));

        assert_eq!(map.len(), 2);
        assert_eq!(map.layer_len(TileLayer::Ground), 1);
        assert_eq!(map.layer_len(TileLayer::Furniture), 0);
        assert_eq!(
            map.get(TileKey::new(1, 1, TileLayer::Liquid)).map(|t| t.block_id),
            Some(7)
        );
    }

    #[test]
    fn checksum_ignores_insertion_order() {
        let keys = [
            TileKey::new(5, 0, TileLayer::Ground),
            TileKey::new(-2, 3, TileLayer::Furniture),
            TileKey::new(0, 0, TileLayer::Liquid),
        ];
        let mut a = TileMap::new();
        let mut b = TileMap::new();
        for (i, key) in keys.iter().enumerate() {
            a.set(*key, TileState::new(i as u16 + 1));
        }
        for (i, key) in keys.iter().enumerate().rev() {
            b.set(*key, TileState::new(i as u16 + 1));
        }
        assert_eq!(a, b);
        assert_eq!(a.checksum(), b.checksum());

        b.set(keys[0], TileState::new(99));
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn get_or_air_materializes_air() {
        let map = TileMap::new();
        assert!(map.get_or_air(TileKey::new(0, 0, TileLayer::Ground)).is_air());
    }
}
