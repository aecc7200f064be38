//! Bulk world transfer: host-side partitioning and peer-side reassembly.
//!
//! The host computes the full chunk list before sending anything, so the
//! start message already carries the final chunk count. Chunks may arrive in
//! any order; the peer completes on chunk count, not on the sentinel.

use crate::codec::encode;
use crate::config::NetConfig;
use crate::error::{NetError, TransferError};
use crate::protocol::{Payload, WorldChunk, WorldTransferComplete, WorldTransferStart};
use crate::queue::OutboundQueue;
use crate::transport::{ConnectionHandle, Transport};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tilesync_core::{TileKey, TileLayer, TileMap, WorldMetadata};
use tracing::{debug, info, warn};

/// Fully partitioned world, ready to send to any number of joiners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldTransferPlan {
    /// Metadata with `total_chunks`, `tile_count` and `checksum` filled in.
    pub metadata: WorldMetadata,
    /// Chunks in index order.
    pub chunks: Vec<WorldChunk>,
}

impl WorldTransferPlan {
    /// Partition `tiles` layer by layer (ground, liquid, furniture) into
    /// chunks of at most `max_tiles_per_chunk`. An empty layer still gets one
    /// empty chunk.
    pub fn build(template: &WorldMetadata, tiles: &TileMap, max_tiles_per_chunk: usize) -> Self {
        let per_chunk = max_tiles_per_chunk.max(1);
        let mut slices: Vec<(TileLayer, Vec<_>)> = Vec::new();
        for layer in TileLayer::ALL {
            let entries: Vec<_> = tiles
                .iter_layer(layer)
                .map(|(pos, state)| (*pos, state.clone()))
                .collect();
            if entries.is_empty() {
                slices.push((layer, Vec::new()));
                continue;
            }
            for slice in entries.chunks(per_chunk) {
                slices.push((layer, slice.to_vec()));
            }
        }

        let total_chunks = slices.len() as u32;
        let chunks = slices
            .into_iter()
            .enumerate()
            .map(|(index, (layer, tiles))| WorldChunk {
                index: index as u32,
                total_chunks,
                layer,
                tiles,
            })
            .collect();

        let mut metadata = template.clone();
        metadata.total_chunks = total_chunks;
        metadata.tile_count = tiles.len() as u64;
        metadata.checksum = tiles.checksum();

        Self { metadata, chunks }
    }

    /// Number of chunks.
    pub fn total_chunks(&self) -> u32 {
        self.metadata.total_chunks
    }
}

/// What a completed host-side send cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Chunks sent.
    pub chunks: u32,
    /// Bytes handed to the transport, start and sentinel included.
    pub bytes: usize,
    /// Explicit flushes issued.
    pub flushes: u32,
    /// Wall time spent in the send loop.
    pub elapsed: Duration,
}

/// Send a planned world to one peer.
///
/// This is the one blocking operation in the tick: every chunk goes through
/// [`OutboundQueue::send_immediate`], with a transport flush and a short
/// pause every `chunk_flush_interval` chunks.
pub fn send_world<T: Transport + ?Sized>(
    plan: &WorldTransferPlan,
    queue: &mut OutboundQueue,
    transport: &mut T,
    destination: ConnectionHandle,
    config: &NetConfig,
) -> Result<TransferStats, NetError> {
    let started = Instant::now();
    let mut stats = TransferStats {
        chunks: 0,
        bytes: 0,
        flushes: 0,
        elapsed: Duration::ZERO,
    };
    info!(
        "Sending world '{}' to {}: {} tiles in {} chunks",
        plan.metadata.name,
        destination,
        plan.metadata.tile_count,
        plan.total_chunks()
    );

    let start = encode(&Payload::WorldTransferStart(WorldTransferStart {
        metadata: plan.metadata.clone(),
    }))?;
    queue.send_immediate(transport, destination, &start)?;
    stats.bytes += start.len();

    let flush_interval = config.chunk_flush_interval.max(1);
    for chunk in &plan.chunks {
        let message = encode(&Payload::WorldChunk(chunk.clone()))?;
        queue.send_immediate(transport, destination, &message)?;
        stats.chunks += 1;
        stats.bytes += message.len();

        if stats.chunks as usize % flush_interval == 0 {
            queue.flush(transport, destination);
            stats.flushes += 1;
            if !config.chunk_pause().is_zero() {
                std::thread::sleep(config.chunk_pause());
            }
        }
    }

    let complete = encode(&Payload::WorldTransferComplete(WorldTransferComplete {
        total_chunks: plan.total_chunks(),
    }))?;
    queue.send_immediate(transport, destination, &complete)?;
    queue.flush(transport, destination);
    stats.bytes += complete.len();
    stats.elapsed = started.elapsed();

    debug!(
        "World sent to {}: {} bytes in {:?}",
        destination, stats.bytes, stats.elapsed
    );
    Ok(stats)
}

/// A fully reassembled and verified world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledWorld {
    /// Metadata from the start message.
    pub metadata: WorldMetadata,
    /// Reassembled tiles.
    pub tiles: TileMap,
}

/// Result of feeding one chunk to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; more chunks outstanding.
    Pending {
        /// Chunks held.
        received: usize,
        /// Chunks announced.
        expected: u32,
    },
    /// Index already held; ignored.
    Duplicate,
    /// No transfer open yet; held until its start message arrives.
    Early,
    /// Last chunk arrived and the world verified.
    Complete(AssembledWorld),
}

#[derive(Debug)]
struct TransferSession {
    metadata: WorldMetadata,
    expected: u32,
    received: BTreeMap<u32, WorldChunk>,
    started_at: Instant,
    last_progress: Instant,
}

/// Chunks held while no transfer is open.
const MAX_EARLY_CHUNKS: usize = 256;

/// Peer-side reassembly of one world transfer at a time.
#[derive(Debug)]
pub struct WorldReassembler {
    session: Option<TransferSession>,
    early: BTreeMap<u32, WorldChunk>,
    timeout: Duration,
}

impl WorldReassembler {
    /// Reassembler that abandons a transfer idle for `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            session: None,
            early: BTreeMap::new(),
            timeout,
        }
    }

    /// Whether a transfer is in progress.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// `(received, expected)` for the transfer in progress.
    pub fn progress(&self) -> Option<(usize, u32)> {
        self.session
            .as_ref()
            .map(|session| (session.received.len(), session.expected))
    }

    /// Open a transfer using the wall clock.
    pub fn on_start(&mut self, metadata: WorldMetadata) -> Result<ChunkOutcome, TransferError> {
        self.on_start_at(Instant::now(), metadata)
    }

    /// Open a transfer, replacing any transfer in progress.
    ///
    /// Chunks that overtook the start message are replayed into the new
    /// transfer, which may complete it outright.
    pub fn on_start_at(&mut self, now: Instant, metadata: WorldMetadata) -> Result<ChunkOutcome, TransferError> {
        if let Some(previous) = &self.session {
            warn!(
                "Replacing unfinished transfer of '{}' ({}/{} chunks)",
                previous.metadata.name,
                previous.received.len(),
                previous.expected
            );
        }
        info!(
            "Receiving world '{}' ({}x{}): {} chunks, {} tiles",
            metadata.name, metadata.width, metadata.height, metadata.total_chunks, metadata.tile_count
        );
        let expected = metadata.total_chunks;
        self.session = Some(TransferSession {
            expected,
            metadata,
            received: BTreeMap::new(),
            started_at: now,
            last_progress: now,
        });

        let mut outcome = ChunkOutcome::Pending {
            received: 0,
            expected,
        };
        for (index, chunk) in std::mem::take(&mut self.early) {
            if chunk.total_chunks != expected {
                debug!("Dropping early chunk {} from another transfer", index);
                continue;
            }
            outcome = self.on_chunk_at(now, chunk)?;
        }
        Ok(outcome)
    }

    /// Store a chunk using the wall clock.
    pub fn on_chunk(&mut self, chunk: WorldChunk) -> Result<ChunkOutcome, TransferError> {
        self.on_chunk_at(Instant::now(), chunk)
    }

    /// Store a chunk; assemble once every index is present.
    ///
    /// Any error abandons the transfer.
    pub fn on_chunk_at(&mut self, now: Instant, chunk: WorldChunk) -> Result<ChunkOutcome, TransferError> {
        let Some(session) = self.session.as_mut() else {
            if self.early.len() >= MAX_EARLY_CHUNKS && !self.early.contains_key(&chunk.index) {
                return Err(TransferError::NoSession);
            }
            debug!("Chunk {} arrived before its transfer start", chunk.index);
            self.early.insert(chunk.index, chunk);
            return Ok(ChunkOutcome::Early);
        };

        if chunk.total_chunks != session.expected {
            let err = TransferError::CountMismatch {
                expected: session.expected,
                got: chunk.total_chunks,
            };
            self.session = None;
            self.early.clear();
            return Err(err);
        }
        if chunk.index >= session.expected {
            let err = TransferError::IndexOutOfRange {
                index: chunk.index,
                total: session.expected,
            };
            self.session = None;
            self.early.clear();
            return Err(err);
        }
        if session.received.contains_key(&chunk.index) {
            debug!("Duplicate chunk {} ignored", chunk.index);
            return Ok(ChunkOutcome::Duplicate);
        }

        session.received.insert(chunk.index, chunk);
        session.last_progress = now;
        if session.received.len() < session.expected as usize {
            return Ok(ChunkOutcome::Pending {
                received: session.received.len(),
                expected: session.expected,
            });
        }

        let Some(session) = self.session.take() else {
            return Err(TransferError::NoSession);
        };
        Self::assemble(session, now).map(ChunkOutcome::Complete)
    }

    /// Sentinel arrived. Completion is driven by chunk count, so this only logs.
    pub fn on_complete(&mut self, total_chunks: u32) {
        match &self.session {
            Some(session) => warn!(
                "Transfer sentinel for {} chunks arrived with {}/{} received",
                total_chunks,
                session.received.len(),
                session.expected
            ),
            None => debug!("Transfer sentinel for {} chunks", total_chunks),
        }
    }

    /// Abandon a transfer that has made no progress within the timeout.
    pub fn check_timeout(&mut self, now: Instant) -> Result<(), TransferError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        if now.saturating_duration_since(session.last_progress) < self.timeout {
            return Ok(());
        }
        let err = TransferError::TimedOut {
            received: session.received.len(),
            expected: session.expected,
        };
        warn!(
            "Abandoning transfer of '{}' after {:?}: {}",
            session.metadata.name,
            now.saturating_duration_since(session.started_at),
            err
        );
        self.session = None;
        self.early.clear();
        Err(err)
    }

    /// Discard the transfer in progress. Returns whether there was one.
    pub fn abandon(&mut self, reason: &str) -> bool {
        self.early.clear();
        match self.session.take() {
            Some(session) => {
                warn!(
                    "Abandoning transfer of '{}' at {}/{} chunks: {}",
                    session.metadata.name,
                    session.received.len(),
                    session.expected,
                    reason
                );
                true
            }
            None => false,
        }
    }

    fn assemble(session: TransferSession, now: Instant) -> Result<AssembledWorld, TransferError> {
        let mut tiles = TileMap::new();
        for chunk in session.received.into_values() {
            for (pos, state) in chunk.tiles {
                tiles.set(TileKey::from_pos(chunk.layer, pos), state);
            }
        }

        let metadata = session.metadata;
        if tiles.len() as u64 != metadata.tile_count {
            return Err(TransferError::TileCountMismatch {
                expected: metadata.tile_count,
                got: tiles.len() as u64,
            });
        }
        let checksum = tiles.checksum();
        if checksum != metadata.checksum {
            return Err(TransferError::ChecksumMismatch {
                expected: metadata.checksum,
                got: checksum,
            });
        }

        info!(
            "World '{}' assembled: {} tiles in {:?}",
            metadata.name,
            tiles.len(),
            now.saturating_duration_since(session.started_at)
        );
        Ok(AssembledWorld { metadata, tiles })
    }
}
