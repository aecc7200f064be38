//! Entity replication keyed purely by [`NetworkId`].
//!
//! Spawns are idempotent, updates for unknown entities create them, and kills
//! for unknown entities are ignored. The host relays every applied change to
//! all peers except the one it came from.

use super::Effects;
use crate::error::NetError;
use crate::events::NetEvent;
use crate::protocol::{EntityKilled, EntityPositionUpdate, EntitySpawned, Payload};
use crate::session::Target;
use std::collections::BTreeMap;
use std::fmt;
use tilesync_core::{NetworkEntitySnapshot, NetworkId, PeerId};
use tracing::{debug, info, trace};

/// Process-local entity handle. Never sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalEntityId(pub u32);

impl fmt::Display for LocalEntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// A registered entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Local handle.
    pub local: LocalEntityId,
    /// Participant that created it.
    pub owner: PeerId,
    /// Latest replicated state.
    pub snapshot: NetworkEntitySnapshot,
    /// Created from an update whose spawn was never seen.
    pub synthesized: bool,
}

/// Registry of replicated entities.
#[derive(Debug)]
pub struct EntityReplicator {
    entities: BTreeMap<NetworkId, EntityRecord>,
    next_local: u32,
    evict_on_disconnect: bool,
}

impl EntityReplicator {
    /// Empty registry.
    pub fn new(evict_on_disconnect: bool) -> Self {
        Self {
            entities: BTreeMap::new(),
            next_local: 0,
            evict_on_disconnect,
        }
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entities are registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Look up an entity.
    pub fn get(&self, network_id: NetworkId) -> Option<&EntityRecord> {
        self.entities.get(&network_id)
    }

    /// Iterate in `NetworkId` order.
    pub fn iter(&self) -> impl Iterator<Item = (&NetworkId, &EntityRecord)> {
        self.entities.iter()
    }

    /// Drop every entity (session ended).
    pub fn clear(&mut self) {
        self.entities.clear();
    }

    fn register(&mut self, owner: PeerId, snapshot: NetworkEntitySnapshot, synthesized: bool) -> LocalEntityId {
        self.next_local += 1;
        let local = LocalEntityId(self.next_local);
        self.entities.insert(
            snapshot.network_id,
            EntityRecord {
                local,
                owner,
                snapshot,
                synthesized,
            },
        );
        local
    }

    fn fresh_id(&self) -> NetworkId {
        let mut id = NetworkId::generate();
        while self.entities.contains_key(&id) {
            id = NetworkId::generate();
        }
        id
    }

    /// Create an entity locally. The snapshot's `network_id` is replaced by
    /// a freshly generated one.
    pub fn spawn_local(
        &mut self,
        is_host: bool,
        owner: PeerId,
        mut snapshot: NetworkEntitySnapshot,
    ) -> Result<(NetworkId, Effects), NetError> {
        let network_id = self.fresh_id();
        snapshot.network_id = network_id;
        let local = self.register(owner, snapshot.clone(), false);
        debug!("Spawned {} as {} (type {})", local, network_id, snapshot.local_id);

        let mut effects = Effects::none();
        let target = if is_host { Target::ALL } else { Target::Host };
        effects.send(target, &Payload::EntitySpawned(EntitySpawned { snapshot, owner }))?;
        Ok((network_id, effects))
    }

    /// Publish new state for a locally known entity.
    pub fn update_local(
        &mut self,
        is_host: bool,
        snapshot: NetworkEntitySnapshot,
    ) -> Result<Effects, NetError> {
        let record = self
            .entities
            .get_mut(&snapshot.network_id)
            .ok_or(NetError::UnknownEntity(snapshot.network_id))?;
        record.snapshot = snapshot.clone();

        let mut effects = Effects::none();
        let target = if is_host { Target::ALL } else { Target::Host };
        effects.send(
            target,
            &Payload::EntityPositionUpdate(EntityPositionUpdate { snapshot }),
        )?;
        Ok(effects)
    }

    /// Remove an entity locally. Unknown ids are a no-op.
    pub fn kill_local(&mut self, is_host: bool, network_id: NetworkId) -> Result<Effects, NetError> {
        let mut effects = Effects::none();
        if self.entities.remove(&network_id).is_none() {
            debug!("Kill for unknown {} ignored", network_id);
            return Ok(effects);
        }
        let target = if is_host { Target::ALL } else { Target::Host };
        effects.send(target, &Payload::EntityKilled(EntityKilled { network_id }))?;
        Ok(effects)
    }

    /// Received `EntitySpawned`. A known `NetworkId` makes this a no-op.
    pub fn on_spawned(
        &mut self,
        is_host: bool,
        sender: PeerId,
        msg: EntitySpawned,
    ) -> Result<Effects, NetError> {
        let mut effects = Effects::none();
        let network_id = msg.snapshot.network_id;
        if self.entities.contains_key(&network_id) {
            debug!("Duplicate spawn of {} from {} suppressed", network_id, sender);
            return Ok(effects);
        }

        // Peers may only create entities they own.
        let owner = if is_host { sender } else { msg.owner };
        let local_id = msg.snapshot.local_id;
        let local = self.register(owner, msg.snapshot.clone(), false);
        trace!("Registered remote {} as {}", network_id, local);
        effects.emit(NetEvent::EntitySpawned {
            network_id,
            local_id,
            owner,
        });
        if is_host {
            effects.send(
                Target::all_except(sender),
                &Payload::EntitySpawned(EntitySpawned {
                    snapshot: msg.snapshot,
                    owner,
                }),
            )?;
        }
        Ok(effects)
    }

    /// Received `EntityPositionUpdate`. An unknown `NetworkId` means the
    /// spawn was missed or is still in flight, so the update creates it.
    pub fn on_position_update(
        &mut self,
        is_host: bool,
        sender: PeerId,
        msg: EntityPositionUpdate,
    ) -> Result<Effects, NetError> {
        let mut effects = Effects::none();
        let network_id = msg.snapshot.network_id;
        let synthesized = match self.entities.get_mut(&network_id) {
            Some(record) => {
                record.snapshot = msg.snapshot.clone();
                false
            }
            None => {
                debug!("Update for unknown {} from {}, synthesizing", network_id, sender);
                self.register(sender, msg.snapshot.clone(), true);
                true
            }
        };
        effects.emit(NetEvent::EntityUpdated {
            network_id,
            synthesized,
        });
        if is_host {
            effects.send(Target::all_except(sender), &Payload::EntityPositionUpdate(msg))?;
        }
        Ok(effects)
    }

    /// Received `EntityKilled`. Unknown ids are a no-op.
    pub fn on_killed(
        &mut self,
        is_host: bool,
        sender: PeerId,
        msg: EntityKilled,
    ) -> Result<Effects, NetError> {
        let mut effects = Effects::none();
        if self.entities.remove(&msg.network_id).is_none() {
            debug!("Kill for unknown {} from {} ignored", msg.network_id, sender);
            return Ok(effects);
        }
        effects.emit(NetEvent::EntityRemoved {
            network_id: msg.network_id,
        });
        if is_host {
            effects.send(Target::all_except(sender), &Payload::EntityKilled(msg))?;
        }
        Ok(effects)
    }

    /// A participant left. With eviction enabled, its entities are removed
    /// and (on the host) the removal is broadcast.
    pub fn on_peer_disconnected(&mut self, is_host: bool, peer: PeerId) -> Result<Effects, NetError> {
        let mut effects = Effects::none();
        if !self.evict_on_disconnect {
            return Ok(effects);
        }
        let owned: Vec<NetworkId> = self
            .entities
            .iter()
            .filter(|(_, record)| record.owner == peer)
            .map(|(id, _)| *id)
            .collect();
        if !owned.is_empty() {
            info!("Evicting {} entities owned by {}", owned.len(), peer);
        }
        for network_id in owned {
            self.entities.remove(&network_id);
            effects.emit(NetEvent::EntityRemoved { network_id });
            if is_host {
                effects.send(Target::ALL, &Payload::EntityKilled(EntityKilled { network_id }))?;
            }
        }
        Ok(effects)
    }

    /// Spawn messages for every live entity, sent to a peer after its world
    /// transfer.
    pub fn catch_up(&self) -> Vec<Payload> {
        self.entities
            .values()
            .map(|record| {
                Payload::EntitySpawned(EntitySpawned {
                    snapshot: record.snapshot.clone(),
                    owner: record.owner,
                })
            })
            .collect()
    }
}
