#![warn(missing_docs)]
//! Host-authoritative replication core for multiplayer tile worlds.
//!
//! One process hosts; peers join it, receive the world in paced chunks and
//! then exchange tile edits, entity updates and chat through the host. The
//! [`NetSubsystem`] drives everything from the game's tick over any
//! [`Transport`]: [`QuicTransport`] for real sessions, [`MemoryTransport`]
//! for tests and the loopback demo.

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod protocol;
pub mod queue;
pub mod quic;
pub mod replication;
pub mod session;
pub mod subsystem;
pub mod transfer;
pub mod transport;

pub use codec::{compute_schema_hash, decode, decode_frame, encode};
pub use config::NetConfig;
pub use error::{NetError, TransferError};
pub use events::NetEvent;
pub use memory::{Delivery, MemoryNetwork, MemoryTransport};
pub use protocol::{Message, MessageKind, Payload, PROTOCOL_MAGIC, PROTOCOL_VERSION};
pub use queue::{DrainReport, OutboundQueue, QueueMetrics};
pub use quic::{QuicConfig, QuicTransport};
pub use replication::{EntityRecord, EntityReplicator, LocalEntityId, TileReplicator};
pub use session::{Role, SessionManager, SessionState, Target};
pub use subsystem::NetSubsystem;
pub use transfer::{WorldReassembler, WorldTransferPlan};
pub use transport::{ConnectionHandle, SendOutcome, Transport, TransportEvent};
