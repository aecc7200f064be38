//! Incremental entity and tile replication.
//!
//! Replicators never touch the transport or the queue. Each operation
//! returns [`Effects`]: messages addressed by [`Target`] plus the events to
//! surface. The subsystem resolves targets against the session registry.

pub mod entity;
pub mod tile;

use crate::codec::encode;
use crate::error::NetError;
use crate::events::NetEvent;
use crate::protocol::{Message, Payload};
use crate::session::Target;

pub use entity::{EntityRecord, EntityReplicator, LocalEntityId};
pub use tile::TileReplicator;

/// One message and who should receive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Addressing.
    pub target: Target,
    /// Encoded message.
    pub message: Message,
}

/// Output of one replicator operation.
#[derive(Debug, Default)]
pub struct Effects {
    /// Messages to enqueue.
    pub outbound: Vec<Outbound>,
    /// Events to surface.
    pub events: Vec<NetEvent>,
}

impl Effects {
    /// No effects.
    pub fn none() -> Self {
        Self::default()
    }

    /// Encode `payload` for `target`.
    pub fn send(&mut self, target: Target, payload: &Payload) -> Result<(), NetError> {
        self.outbound.push(Outbound {
            target,
            message: encode(payload)?,
        });
        Ok(())
    }

    /// Surface an event.
    pub fn emit(&mut self, event: NetEvent) {
        self.events.push(event);
    }

    /// Append another operation's effects.
    pub fn extend(&mut self, other: Effects) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
    }

    /// Whether nothing needs doing.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }
}
