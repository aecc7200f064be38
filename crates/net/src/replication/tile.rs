//! Tile replication with host-authoritative arbitration.
//!
//! Single edits travel as `TileChanged`; per-tick instance-state churn
//! (liquid flow, timers) is gathered in a dirty set and flushed as
//! `TileUpdated` batches, one layer at a time.

use super::Effects;
use crate::error::NetError;
use crate::events::NetEvent;
use crate::protocol::{Actor, Payload, TileChanged, TileUpdated};
use crate::session::Target;
use std::collections::{BTreeMap, BTreeSet};
use tilesync_core::{PeerId, TileKey, TileLayer, TileMap, TilePos, TileState, WorldMetadata};
use tracing::{debug, trace, warn};

/// Remote edits held back while a world transfer is open.
const MAX_HELD_EDITS: usize = 4096;

/// A remote edit received before the world it applies to.
#[derive(Debug, Clone)]
enum HeldEdit {
    Changed(PeerId, TileChanged),
    Updated(PeerId, TileUpdated),
}

/// Who last wrote a key on the host. `None` is the host itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LastWrite {
    writer: Option<PeerId>,
    contested: bool,
}

/// Owns the active tile map and the per-tick dirty set.
#[derive(Debug)]
pub struct TileReplicator {
    tiles: TileMap,
    metadata: Option<WorldMetadata>,
    dirty: BTreeSet<TileKey>,
    max_tiles_per_chunk: usize,
    held: Option<Vec<HeldEdit>>,
    writes: BTreeMap<TileKey, LastWrite>,
}

impl TileReplicator {
    /// Empty world, no bounds.
    pub fn new(max_tiles_per_chunk: usize) -> Self {
        Self {
            tiles: TileMap::new(),
            metadata: None,
            dirty: BTreeSet::new(),
            max_tiles_per_chunk: max_tiles_per_chunk.max(1),
            held: None,
            writes: BTreeMap::new(),
        }
    }

    /// Active tiles.
    pub fn tiles(&self) -> &TileMap {
        &self.tiles
    }

    /// Mutable access for the simulation. Pair with [`Self::mark_dirty`].
    pub fn tiles_mut(&mut self) -> &mut TileMap {
        &mut self.tiles
    }

    /// Metadata of the loaded world, if any.
    pub fn metadata(&self) -> Option<&WorldMetadata> {
        self.metadata.as_ref()
    }

    /// Tile at `key`; `None` means air.
    pub fn get(&self, key: TileKey) -> Option<&TileState> {
        self.tiles.get(key)
    }

    /// Swap in a new world, dropping pending dirty tiles and held edits.
    pub fn replace_world(&mut self, metadata: WorldMetadata, tiles: TileMap) {
        debug!(
            "Replacing world with '{}' ({} tiles)",
            metadata.name,
            tiles.len()
        );
        self.tiles = tiles;
        self.metadata = Some(metadata);
        self.dirty.clear();
        self.held = None;
        self.writes.clear();
    }

    /// Swap in a transferred world and replay the remote edits held back
    /// while it was in flight.
    pub fn install_world(
        &mut self,
        metadata: WorldMetadata,
        tiles: TileMap,
    ) -> Result<Effects, NetError> {
        let held = self.held.take().unwrap_or_default();
        self.replace_world(metadata, tiles);
        if !held.is_empty() {
            debug!("Replaying {} tile edits onto the new world", held.len());
        }
        self.replay(held)
    }

    /// Hold remote edits until the next [`Self::install_world`].
    pub fn hold_remote_edits(&mut self) {
        if self.held.is_none() {
            trace!("Holding remote tile edits");
            self.held = Some(Vec::new());
        }
    }

    /// Stop holding and apply the held edits to the current map.
    pub fn release_held(&mut self) -> Result<Effects, NetError> {
        let held = self.held.take().unwrap_or_default();
        self.replay(held)
    }

    fn replay(&mut self, held: Vec<HeldEdit>) -> Result<Effects, NetError> {
        let mut effects = Effects::none();
        for edit in held {
            let applied = match edit {
                HeldEdit::Changed(sender, msg) => self.on_tile_changed(false, sender, msg)?,
                HeldEdit::Updated(sender, msg) => self.on_tile_updated(false, sender, msg)?,
            };
            effects.extend(applied);
        }
        Ok(effects)
    }

    /// Queue `edit` if a transfer is open. Returns it back otherwise.
    fn hold(&mut self, edit: HeldEdit) -> Option<HeldEdit> {
        match self.held.as_mut() {
            Some(held) if held.len() < MAX_HELD_EDITS => {
                held.push(edit);
                None
            }
            Some(_) => {
                warn!("Held tile edits full; applying to the current world");
                Some(edit)
            }
            None => Some(edit),
        }
    }

    /// Forget the world (session ended).
    pub fn clear(&mut self) {
        self.tiles = TileMap::new();
        self.metadata = None;
        self.dirty.clear();
        self.held = None;
        self.writes.clear();
    }

    /// Host bookkeeping for one applied write. Returns true when the origin
    /// must be sent the host's result because another writer touched the key
    /// since the origin's last edit.
    fn record_write(&mut self, key: TileKey, writer: Option<PeerId>) -> bool {
        let contested = writer.is_some()
            && self
                .writes
                .get(&key)
                .is_some_and(|last| last.writer != writer || last.contested);
        self.writes.insert(key, LastWrite { writer, contested });
        contested
    }

    fn in_bounds(&self, key: TileKey) -> bool {
        self.metadata
            .as_ref()
            .map(|meta| meta.contains(key.x, key.y))
            .unwrap_or(true)
    }

    /// Local edit.
    ///
    /// The host applies and broadcasts. A peer applies provisionally and
    /// asks the host, whose answer may later overwrite it.
    pub fn set_local(
        &mut self,
        is_host: bool,
        key: TileKey,
        state: TileState,
        actor: Actor,
    ) -> Result<Effects, NetError> {
        if !self.in_bounds(key) {
            return Err(NetError::OutOfBounds(key));
        }
        self.tiles.set(key, state.clone());
        let msg = TileChanged { key, state, actor };
        if is_host {
            self.record_write(key, None);
        } else if let Some(held) = self.held.as_mut() {
            // Reapplied on top of the world the host is sending.
            held.push(HeldEdit::Changed(msg.actor.peer, msg.clone()));
        }

        let target = if is_host { Target::ALL } else { Target::Host };
        let mut effects = Effects::none();
        effects.send(target, &Payload::TileChanged(msg))?;
        Ok(effects)
    }

    /// Received `TileChanged`.
    ///
    /// On the host the edit is checked, applied and relayed to everyone but
    /// the origin; a refused edit is answered with the host's own state so the
    /// origin rolls back its provisional change. An edit that raced another
    /// writer on the same key is also echoed to its origin, which may have
    /// applied the other writer's relay over its own provisional value.
    ///
    /// A peer holding edits for an in-flight world defers the edit.
    pub fn on_tile_changed(
        &mut self,
        is_host: bool,
        sender: PeerId,
        msg: TileChanged,
    ) -> Result<Effects, NetError> {
        let mut effects = Effects::none();
        let msg = if is_host {
            msg
        } else {
            match self.hold(HeldEdit::Changed(sender, msg)) {
                Some(HeldEdit::Changed(_, msg)) => msg,
                _ => return Ok(effects),
            }
        };

        if is_host && !self.in_bounds(msg.key) {
            warn!(
                "Refusing out-of-bounds edit {:?} from {} ({})",
                msg.key, sender, msg.actor.name
            );
            let truth = TileChanged {
                key: msg.key,
                state: self.tiles.get_or_air(msg.key),
                actor: Actor::NONE,
            };
            effects.send(Target::Peer(sender), &Payload::TileChanged(truth))?;
            effects.emit(NetEvent::TileCorrected {
                key: msg.key,
                origin: sender,
            });
            return Ok(effects);
        }

        trace!(
            "Tile {:?} -> block {} by {}",
            msg.key,
            msg.state.block_id,
            msg.actor.peer
        );
        self.tiles.set(msg.key, msg.state.clone());
        effects.emit(NetEvent::TileChanged {
            key: msg.key,
            state: msg.state.clone(),
            actor: msg.actor.peer,
        });
        if is_host {
            if self.record_write(msg.key, Some(sender)) {
                debug!("Echoing contested tile {:?} to {}", msg.key, sender);
                effects.send(Target::Peer(sender), &Payload::TileChanged(msg.clone()))?;
            }
            effects.send(Target::all_except(sender), &Payload::TileChanged(msg))?;
        }
        Ok(effects)
    }

    /// Set a tile whose instance state evolved and mark it for the next flush.
    pub fn update_local(&mut self, key: TileKey, state: TileState) {
        self.tiles.set(key, state);
        self.dirty.insert(key);
    }

    /// Record that the simulation mutated `key` this tick.
    pub fn mark_dirty(&mut self, key: TileKey) {
        self.dirty.insert(key);
    }

    /// Tiles waiting for the next flush.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Drain the dirty set into per-layer `TileUpdated` batches.
    pub fn flush_dirty(&mut self, is_host: bool) -> Result<Effects, NetError> {
        let mut effects = Effects::none();
        if self.dirty.is_empty() {
            return Ok(effects);
        }

        let mut by_layer: BTreeMap<TileLayer, Vec<(TilePos, TileState)>> = BTreeMap::new();
        for key in std::mem::take(&mut self.dirty) {
            if is_host {
                self.record_write(key, None);
            }
            by_layer
                .entry(key.layer)
                .or_default()
                .push((key.pos(), self.tiles.get_or_air(key)));
        }

        let target = if is_host { Target::ALL } else { Target::Host };
        for (layer, entries) in by_layer {
            for batch in entries.chunks(self.max_tiles_per_chunk) {
                effects.send(
                    target,
                    &Payload::TileUpdated(TileUpdated {
                        layer,
                        tiles: batch.to_vec(),
                    }),
                )?;
            }
        }
        debug!("Flushed {} dirty tile batches", effects.outbound.len());
        Ok(effects)
    }

    /// Received `TileUpdated`. The host drops out-of-bounds entries, echoes
    /// contested ones to the origin and relays the rest to everyone but the
    /// origin.
    pub fn on_tile_updated(
        &mut self,
        is_host: bool,
        sender: PeerId,
        msg: TileUpdated,
    ) -> Result<Effects, NetError> {
        let mut effects = Effects::none();
        let msg = if is_host {
            msg
        } else {
            match self.hold(HeldEdit::Updated(sender, msg)) {
                Some(HeldEdit::Updated(_, msg)) => msg,
                _ => return Ok(effects),
            }
        };
        let layer = msg.layer;
        let total = msg.tiles.len();

        let accepted: Vec<(TilePos, TileState)> = msg
            .tiles
            .into_iter()
            .filter(|(pos, _)| !is_host || self.in_bounds(TileKey::from_pos(layer, *pos)))
            .collect();
        if accepted.len() < total {
            warn!(
                "Dropped {} out-of-bounds {} updates from {}",
                total - accepted.len(),
                layer.as_str(),
                sender
            );
        }
        if accepted.is_empty() {
            return Ok(effects);
        }

        for (pos, state) in &accepted {
            self.tiles.set(TileKey::from_pos(layer, *pos), state.clone());
        }
        effects.emit(NetEvent::TilesUpdated {
            layer,
            count: accepted.len(),
        });
        if is_host {
            let contested: Vec<(TilePos, TileState)> = accepted
                .iter()
                .filter(|(pos, _)| self.record_write(TileKey::from_pos(layer, *pos), Some(sender)))
                .cloned()
                .collect();
            if !contested.is_empty() {
                effects.send(
                    Target::Peer(sender),
                    &Payload::TileUpdated(TileUpdated {
                        layer,
                        tiles: contested,
                    }),
                )?;
            }
            effects.send(
                Target::all_except(sender),
                &Payload::TileUpdated(TileUpdated {
                    layer,
                    tiles: accepted,
                }),
            )?;
        }
        Ok(effects)
    }
}
