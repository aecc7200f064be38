//! Replicated entity snapshots.
//!
//! Entities are reconciled purely by [`NetworkId`]. The `local_id` carried in a
//! snapshot is the sender's type tag and is only used to pick which kind of
//! entity to instantiate.

use crate::ids::NetworkId;
use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Version of the [`ExtraKey`] set. Bump whenever a key is added or retyped.
pub const EXTRA_SCHEMA_VERSION: u16 = 1;

/// Upper bound on extra fields carried by one snapshot.
pub const MAX_EXTRA_FIELDS: usize = 16;

/// Maximum byte length of an [`ExtraValue::Text`].
const MAX_EXTRA_TEXT_LEN: usize = 64;

/// 2D vector in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    /// Horizontal component.
    pub x: f32,
    /// Vertical component.
    pub y: f32,
}

impl Vec2 {
    /// Zero vector.
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    /// Construct a vector.
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

bitflags::bitflags! {
    /// Boolean entity state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EntityFlags: u16 {
        /// Entity participates in simulation.
        const ACTIVE = 1 << 0;
        /// Standing on solid ground.
        const GROUNDED = 1 << 1;
        /// Submerged in a liquid layer tile.
        const WET = 1 << 2;
        /// Ignores tile collision.
        const NO_CLIP = 1 << 3;
        /// Hostile to players.
        const HOSTILE = 1 << 4;
        /// Sprite mirrored horizontally.
        const FACING_LEFT = 1 << 5;
    }
}

impl Default for EntityFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Closed set of extra fields an entity may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExtraKey {
    /// Item type of a dropped item entity.
    ItemId = 0,
    /// Stack size of a dropped item entity.
    StackSize = 1,
    /// Player that owns a projectile or pet.
    Owner = 2,
    /// Display label (name tags, signs carried by NPCs).
    Label = 3,
    /// AI state machine phase.
    AiPhase = 4,
    /// Generic countdown in seconds.
    Timer = 5,
    /// Horizontal facing, -1 or 1.
    Direction = 6,
    /// Whether the entity can be picked up.
    Collectable = 7,
}

/// Kind tag of an [`ExtraValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtraValueKind {
    /// [`ExtraValue::Bool`].
    Bool,
    /// [`ExtraValue::Int`].
    Int,
    /// [`ExtraValue::Float`].
    Float,
    /// [`ExtraValue::Text`].
    Text,
    /// [`ExtraValue::Peer`].
    Peer,
}

impl ExtraKey {
    /// The value kind this key must carry.
    pub const fn expected_kind(self) -> ExtraValueKind {
        match self {
            Self::ItemId | Self::StackSize | Self::AiPhase | Self::Direction => ExtraValueKind::Int,
            Self::Owner => ExtraValueKind::Peer,
            Self::Label => ExtraValueKind::Text,
            Self::Timer => ExtraValueKind::Float,
            Self::Collectable => ExtraValueKind::Bool,
        }
    }
}

/// Tagged value stored under an [`ExtraKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtraValue {
    /// Flag.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f32),
    /// Short UTF-8 text.
    Text(String),
    /// Participant reference.
    Peer(PeerId),
}

impl ExtraValue {
    /// Kind tag of this value.
    pub fn kind(&self) -> ExtraValueKind {
        match self {
            Self::Bool(_) => ExtraValueKind::Bool,
            Self::Int(_) => ExtraValueKind::Int,
            Self::Float(_) => ExtraValueKind::Float,
            Self::Text(_) => ExtraValueKind::Text,
            Self::Peer(_) => ExtraValueKind::Peer,
        }
    }
}

/// Rejected extra field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtraError {
    /// Value kind does not match the key's declared kind.
    #[error("extra field {key:?} expects {expected:?}, got {found:?}")]
    WrongKind {
        /// Offending key.
        key: ExtraKey,
        /// Kind declared by the key.
        expected: ExtraValueKind,
        /// Kind supplied.
        found: ExtraValueKind,
    },
    /// Text longer than the wire limit.
    #[error("extra field {key:?} text is {len} bytes (max {max})", max = MAX_EXTRA_TEXT_LEN)]
    TextTooLong {
        /// Offending key.
        key: ExtraKey,
        /// Supplied length.
        len: usize,
    },
    /// Too many fields.
    #[error("{0} extra fields (max {max})", max = MAX_EXTRA_FIELDS)]
    TooMany(usize),
}

/// Typed extra data attached to an entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtraFields(BTreeMap<ExtraKey, ExtraValue>);

impl ExtraFields {
    /// No extra data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a type-checked value, returning the previous one.
    pub fn insert(&mut self, key: ExtraKey, value: ExtraValue) -> Result<Option<ExtraValue>, ExtraError> {
        check_field(key, &value)?;
        Ok(self.0.insert(key, value))
    }

    /// Builder-style insert for literals in tests and spawners.
    pub fn with(mut self, key: ExtraKey, value: ExtraValue) -> Result<Self, ExtraError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Look up a field.
    pub fn get(&self, key: ExtraKey) -> Option<&ExtraValue> {
        self.0.get(&key)
    }

    /// Remove a field.
    pub fn remove(&mut self, key: ExtraKey) -> Option<ExtraValue> {
        self.0.remove(&key)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no fields are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&ExtraKey, &ExtraValue)> {
        self.0.iter()
    }

    /// Validate every field. Decoded data bypasses `insert`, so receivers call this.
    pub fn verify(&self) -> Result<(), ExtraError> {
        if self.0.len() > MAX_EXTRA_FIELDS {
            return Err(ExtraError::TooMany(self.0.len()));
        }
        for (key, value) in &self.0 {
            check_field(*key, value)?;
        }
        Ok(())
    }
}

fn check_field(key: ExtraKey, value: &ExtraValue) -> Result<(), ExtraError> {
    let expected = key.expected_kind();
    if value.kind() != expected {
        return Err(ExtraError::WrongKind {
            key,
            expected,
            found: value.kind(),
        });
    }
    if let ExtraValue::Text(text) = value {
        if text.len() > MAX_EXTRA_TEXT_LEN {
            return Err(ExtraError::TextTooLong {
                key,
                len: text.len(),
            });
        }
    }
    Ok(())
}

/// Full replicated state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEntitySnapshot {
    /// Sender's type tag, used to instantiate the entity kind.
    pub local_id: u16,
    /// Reconciliation identity.
    pub network_id: NetworkId,
    /// World position.
    pub position: Vec2,
    /// Velocity in world units per tick.
    pub velocity: Vec2,
    /// Rotation in radians.
    pub orientation: f32,
    /// Current health.
    pub health: i32,
    /// State bits.
    pub flags: EntityFlags,
    /// Typed extra data.
    pub extra: ExtraFields,
}

impl NetworkEntitySnapshot {
    /// A resting entity of type `local_id` at `position`.
    pub fn new(local_id: u16, network_id: NetworkId, position: Vec2) -> Self {
        Self {
            local_id,
            network_id,
            position,
            velocity: Vec2::ZERO,
            orientation: 0.0,
            health: 0,
            flags: EntityFlags::ACTIVE,
            extra: ExtraFields::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_enforces_declared_kind() {
        let mut extra = ExtraFields::new();
        extra
            .insert(ExtraKey::StackSize, ExtraValue::Int(99))
            .expect("int accepted");

        let err = extra
            .insert(ExtraKey::StackSize, ExtraValue::Text("99".into()))
            .unwrap_err();
        assert!(matches!(err, ExtraError::WrongKind { key: ExtraKey::StackSize, .. }));
        assert_eq!(extra.get(ExtraKey::StackSize), Some(&ExtraValue::Int(99)));
    }

    #[test]
    fn verify_catches_decoded_garbage() {
        let json = r#"{"Label":{"Bool":true}}"#;
        let extra: ExtraFields = serde_json::from_str(json).expect("shape parses");
        assert!(extra.verify().is_err());
    }

    #[test]
    fn long_text_rejected() {
        let err = ExtraFields::new()
            .with(ExtraKey::Label, ExtraValue::Text("x".repeat(65)))
            .unwrap_err();
        assert!(matches!(err, ExtraError::TextTooLong { len: 65, .. }));
    }

    #[test]
    fn flags_default_empty() {
        let snapshot = NetworkEntitySnapshot::new(3, NetworkId::generate(), Vec2::new(1.0, 2.0));
        assert!(snapshot.flags.contains(EntityFlags::ACTIVE));
        assert!(!snapshot.flags.contains(EntityFlags::HOSTILE));
        assert!(EntityFlags::default().is_empty());
    }
}
