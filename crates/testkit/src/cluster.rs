//! In-process sessions: one host and any number of peers over a
//! [`MemoryNetwork`], stepped together on a virtual clock.

use crate::report::{NodeMetrics, SessionReport, SessionReportBuilder, TestResult};
use crate::traffic::{JsonlSink, TrafficRecord};
use anyhow::{bail, Context, Result};
use std::time::{Duration, Instant};
use tilesync_core::{PeerId, SimTick, TileMap, WorldMetadata};
use tilesync_net::{
    MemoryNetwork, MemoryTransport, MessageKind, NetConfig, NetEvent, NetSubsystem, Role,
    SessionState,
};
use tracing::debug;

/// Identity of the cluster host.
pub const HOST_PEER: PeerId = PeerId(1);

/// Identity of the `index`-th peer.
pub fn peer_id(index: usize) -> PeerId {
    PeerId(100 + index as u64)
}

/// One subsystem over the loopback transport.
pub type LoopbackNode = NetSubsystem<MemoryTransport>;

/// Host plus peers sharing one memory network.
pub struct LoopbackCluster {
    network: MemoryNetwork,
    config: NetConfig,
    host: LoopbackNode,
    peers: Vec<LoopbackNode>,
    now: Instant,
    step: Duration,
    tick: SimTick,
    traffic: Vec<TrafficRecord>,
}

impl LoopbackCluster {
    /// A hosting node and `peer_count` disconnected peers.
    pub fn new(peer_count: usize, config: NetConfig) -> Result<Self> {
        Self::with_seed(peer_count, config, 0)
    }

    /// Like [`Self::new`] with a fixed seed for transport reordering.
    pub fn with_seed(peer_count: usize, config: NetConfig, seed: u64) -> Result<Self> {
        let network = MemoryNetwork::with_seed(seed);
        let mut host = NetSubsystem::new(HOST_PEER, "host", config.clone(), network.endpoint(HOST_PEER))
            .context("Failed to create host")?;
        host.start_hosting()?;

        let mut cluster = Self {
            network,
            config,
            host,
            peers: Vec::with_capacity(peer_count),
            now: Instant::now(),
            step: Duration::from_millis(16),
            tick: SimTick::ZERO,
            traffic: Vec::new(),
        };
        for _ in 0..peer_count {
            cluster.add_peer()?;
        }
        Ok(cluster)
    }

    /// Add a disconnected peer and return its index.
    pub fn add_peer(&mut self) -> Result<usize> {
        let index = self.peers.len();
        let id = peer_id(index);
        let node = NetSubsystem::new(
            id,
            format!("peer{index}"),
            self.config.clone(),
            self.network.endpoint(id),
        )
        .with_context(|| format!("Failed to create {id}"))?;
        self.peers.push(node);
        Ok(index)
    }

    /// Shared hub, for fault injection.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// The host node.
    pub fn host(&self) -> &LoopbackNode {
        &self.host
    }

    /// The host node, mutably.
    pub fn host_mut(&mut self) -> &mut LoopbackNode {
        &mut self.host
    }

    /// Peer `index`.
    ///
    /// # Panics
    /// If `index` is out of range.
    pub fn peer(&self, index: usize) -> &LoopbackNode {
        &self.peers[index]
    }

    /// Peer `index`, mutably.
    ///
    /// # Panics
    /// If `index` is out of range.
    pub fn peer_mut(&mut self, index: usize) -> &mut LoopbackNode {
        &mut self.peers[index]
    }

    /// Number of peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Virtual time of the last tick.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Ticks run so far.
    pub fn current_tick(&self) -> SimTick {
        self.tick
    }

    /// Move the virtual clock without ticking.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Install a world on the host.
    pub fn load_world(&mut self, metadata: WorldMetadata, tiles: TileMap) -> Result<()> {
        self.host.load_world(metadata, tiles)?;
        Ok(())
    }

    /// Start joining peer `index` to the host.
    pub fn join(&mut self, index: usize) -> Result<()> {
        self.peers
            .get_mut(index)
            .with_context(|| format!("no peer {index}"))?
            .join(HOST_PEER)?;
        Ok(())
    }

    /// Join every peer and tick until each holds the host's world.
    pub fn join_all(&mut self) -> Result<()> {
        for index in 0..self.peers.len() {
            if self.peers[index].session().state() == SessionState::Disconnected {
                self.join(index)?;
            }
        }
        self.run_until(500, |cluster| {
            cluster.peers.iter().all(|peer| {
                peer.session().state() == SessionState::Connected(Role::Peer)
                    && peer.tiles().metadata().is_some()
                    && peer.transfer_progress().is_none()
            })
        })
        .map(|_| ())
        .context("Peers did not finish joining")
    }

    /// One round: the host ticks first, then every peer in index order.
    pub fn tick(&mut self) {
        self.now += self.step;
        self.tick = self.tick.advance(1);
        self.host.tick_at(self.now);
        for peer in &mut self.peers {
            peer.tick_at(self.now);
        }
        for delivery in self.network.take_deliveries() {
            self.traffic.push(TrafficRecord {
                tick: self.tick,
                from: delivery.from.0,
                to: delivery.to.0,
                kind: MessageKind::from_u8(delivery.kind)
                    .map(|kind| kind.as_str().to_string())
                    .unwrap_or_else(|| "unknown".into()),
                bytes: delivery.bytes,
            });
        }
    }

    /// Run `ticks` rounds.
    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick until `done` holds, failing after `max_ticks` rounds. Returns
    /// the rounds taken.
    pub fn run_until(&mut self, max_ticks: usize, mut done: impl FnMut(&Self) -> bool) -> Result<usize> {
        for taken in 0..=max_ticks {
            if done(self) {
                debug!("Condition met after {} ticks", taken);
                return Ok(taken);
            }
            if taken < max_ticks {
                self.tick();
            }
        }
        bail!("condition not met within {max_ticks} ticks")
    }

    /// Drain events from the host.
    pub fn host_events(&mut self) -> Vec<NetEvent> {
        self.host.drain_events()
    }

    /// Drain events from peer `index`.
    ///
    /// # Panics
    /// If `index` is out of range.
    pub fn peer_events(&mut self, index: usize) -> Vec<NetEvent> {
        self.peers[index].drain_events()
    }

    /// Discard every pending event on every node.
    pub fn clear_events(&mut self) {
        self.host.drain_events();
        for peer in &mut self.peers {
            peer.drain_events();
        }
    }

    /// Every delivery recorded so far.
    pub fn traffic(&self) -> &[TrafficRecord] {
        &self.traffic
    }

    /// Take the recorded deliveries.
    pub fn take_traffic(&mut self) -> Vec<TrafficRecord> {
        std::mem::take(&mut self.traffic)
    }

    /// Append the recorded deliveries to a JSONL sink.
    pub fn write_traffic(&self, sink: &mut JsonlSink) -> Result<()> {
        for record in &self.traffic {
            sink.write(record)?;
        }
        Ok(())
    }

    /// Summarize queue and replication state of every node.
    pub fn report(&self, name: impl Into<String>, result: TestResult) -> SessionReport {
        let nodes = std::iter::once(&self.host)
            .chain(self.peers.iter())
            .map(NodeMetrics::from_node)
            .collect();
        SessionReportBuilder::new(name)
            .result(result)
            .ticks(self.tick.0)
            .messages(self.traffic.len() as u64)
            .bytes(self.traffic.iter().map(|r| r.bytes as u64).sum())
            .nodes(nodes)
            .build()
    }
}
