//! Tunables for pacing, chunking and transfer timeouts.

use crate::error::NetError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Network subsystem configuration.
///
/// Durations are stored as whole milliseconds so the struct maps directly
/// onto a `[net]` TOML table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Upper bound on tiles in one `WorldChunk` or `TileUpdated` message.
    pub max_tiles_per_chunk: usize,
    /// Upper bound on messages sent by one queue drain.
    pub max_messages_per_drain: usize,
    /// Floor of the adaptive inter-drain wait.
    pub min_wait_ms: u64,
    /// Ceiling of the adaptive inter-drain wait.
    pub max_wait_ms: u64,
    /// Multiplier applied to the wait after a rate-limit response.
    pub backoff_factor: f64,
    /// Chunks sent between explicit transport flushes during a world transfer.
    pub chunk_flush_interval: usize,
    /// Blocking pause after each flush during a world transfer.
    pub chunk_pause_ms: u64,
    /// Idle time after which a peer abandons an incomplete world transfer.
    pub transfer_timeout_ms: u64,
    /// Inbound messages dispatched per tick.
    pub max_receive_batch: usize,
    /// Rate-limit retries before a blocking send gives up.
    pub max_immediate_retries: u32,
    /// Whether entities owned by a departed peer are removed.
    pub evict_entities_on_disconnect: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_tiles_per_chunk: 25,
            max_messages_per_drain: 32,
            min_wait_ms: 5,
            max_wait_ms: 60,
            backoff_factor: 2.0,
            chunk_flush_interval: 8,
            chunk_pause_ms: 2,
            transfer_timeout_ms: 30_000,
            max_receive_batch: 256,
            max_immediate_retries: 16,
            evict_entities_on_disconnect: true,
        }
    }
}

impl NetConfig {
    /// Configuration for in-process tests: no blocking pauses.
    pub fn for_tests() -> Self {
        Self {
            chunk_pause_ms: 0,
            ..Self::default()
        }
    }

    /// Reject configurations that would stall or spin.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.max_tiles_per_chunk == 0 {
            return Err(NetError::Config("max_tiles_per_chunk must be > 0".into()));
        }
        if self.max_tiles_per_chunk > crate::protocol::MAX_TILES_PER_MESSAGE {
            return Err(NetError::Config(format!(
                "max_tiles_per_chunk {} exceeds protocol limit {}",
                self.max_tiles_per_chunk,
                crate::protocol::MAX_TILES_PER_MESSAGE
            )));
        }
        if self.max_messages_per_drain == 0 {
            return Err(NetError::Config("max_messages_per_drain must be > 0".into()));
        }
        if self.min_wait_ms == 0 || self.min_wait_ms > self.max_wait_ms {
            return Err(NetError::Config(format!(
                "wait bounds must satisfy 0 < min ({}) <= max ({})",
                self.min_wait_ms, self.max_wait_ms
            )));
        }
        if !(self.backoff_factor > 1.0) || !self.backoff_factor.is_finite() {
            return Err(NetError::Config(format!(
                "backoff_factor must be a finite value > 1, got {}",
                self.backoff_factor
            )));
        }
        if self.chunk_flush_interval == 0 {
            return Err(NetError::Config("chunk_flush_interval must be > 0".into()));
        }
        if self.max_receive_batch == 0 {
            return Err(NetError::Config("max_receive_batch must be > 0".into()));
        }
        Ok(())
    }

    /// Floor of the adaptive wait.
    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    /// Ceiling of the adaptive wait.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Pause between chunk batches.
    pub fn chunk_pause(&self) -> Duration {
        Duration::from_millis(self.chunk_pause_ms)
    }

    /// Transfer idle timeout.
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}
