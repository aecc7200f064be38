//! The per-tick network driver.
//!
//! [`NetSubsystem`] owns one transport plus every piece of replication
//! state. The game calls [`NetSubsystem::tick`] once per frame and drains
//! [`NetEvent`]s afterwards; nothing here spawns threads or blocks, except
//! the paced world send when a peer joins.

use crate::codec::{decode_frame, encode};
use crate::config::NetConfig;
use crate::error::{NetError, TransferError};
use crate::events::NetEvent;
use crate::protocol::{
    self, Actor, ChatMessage, Handshake, Payload, PeerJoined, Welcome, WorldRequest, MAX_CHAT_LEN,
    MAX_NAME_LEN, MAX_REASON_LEN,
};
use crate::queue::{OutboundQueue, QueueMetrics};
use crate::replication::{Effects, EntityReplicator, TileReplicator};
use crate::session::{Role, Route, SessionManager, SessionState, Target};
use crate::transfer::{send_world, ChunkOutcome, TransferStats, WorldReassembler, WorldTransferPlan};
use crate::transport::{ConnectionHandle, Transport, TransportEvent};
use std::time::{Duration, Instant};
use tilesync_core::{
    NetworkEntitySnapshot, NetworkId, PeerId, SimTick, TileKey, TileMap, TileState, WorldMetadata,
};
use tracing::{debug, info, instrument, trace, warn};

/// How long a rejected connection stays open so the rejection can arrive.
const REJECT_GRACE: Duration = Duration::from_secs(1);

/// Everything one participant needs to take part in a session.
pub struct NetSubsystem<T: Transport> {
    config: NetConfig,
    transport: T,
    session: SessionManager,
    queue: OutboundQueue,
    reassembler: WorldReassembler,
    tiles: TileReplicator,
    entities: EntityReplicator,
    events: Vec<NetEvent>,
    rejected: Vec<(ConnectionHandle, Instant)>,
    dialing: Option<ConnectionHandle>,
    tick: SimTick,
}

impl<T: Transport> NetSubsystem<T> {
    /// Build a disconnected subsystem for `local` over `transport`.
    pub fn new(
        local: PeerId,
        display_name: impl Into<String>,
        config: NetConfig,
        transport: T,
    ) -> Result<Self, NetError> {
        config.validate()?;
        let display_name = display_name.into();
        if display_name.trim().is_empty() || display_name.len() > MAX_NAME_LEN {
            return Err(NetError::Config(format!(
                "display name must be 1..={MAX_NAME_LEN} bytes"
            )));
        }
        if local.is_none() {
            return Err(NetError::Config("local peer id must not be zero".into()));
        }

        Ok(Self {
            queue: OutboundQueue::new(&config),
            reassembler: WorldReassembler::new(config.transfer_timeout()),
            tiles: TileReplicator::new(config.max_tiles_per_chunk),
            entities: EntityReplicator::new(config.evict_entities_on_disconnect),
            session: SessionManager::new(local, display_name),
            events: Vec::new(),
            rejected: Vec::new(),
            dialing: None,
            tick: SimTick::ZERO,
            config,
            transport,
        })
    }

    /// Local identity.
    pub fn local_peer(&self) -> PeerId {
        self.session.local_peer()
    }

    /// Session state and registry.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Replicated tile world.
    pub fn tiles(&self) -> &TileReplicator {
        &self.tiles
    }

    /// Replicated entities.
    pub fn entities(&self) -> &EntityReplicator {
        &self.entities
    }

    /// Active configuration.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Outbound queue counters.
    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    /// Messages waiting in the outbound queue.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// `(received, expected)` chunks of the world transfer in progress.
    pub fn transfer_progress(&self) -> Option<(usize, u32)> {
        self.reassembler.progress()
    }

    /// Ticks run so far.
    pub fn current_tick(&self) -> SimTick {
        self.tick
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Take every event raised since the last call.
    pub fn drain_events(&mut self) -> Vec<NetEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start hosting: `Disconnected → Hosting`.
    pub fn host(&mut self) -> Result<(), NetError> {
        self.session.host()
    }

    /// The platform confirmed the hosted session.
    pub fn on_session_created(&mut self) -> Result<(), NetError> {
        self.session.on_session_created()?;
        self.events.push(NetEvent::SessionStarted { role: Role::Host });
        Ok(())
    }

    /// [`Self::host`] and [`Self::on_session_created`] in one step, for
    /// transports without an asynchronous session directory.
    pub fn start_hosting(&mut self) -> Result<(), NetError> {
        self.host()?;
        self.on_session_created()
    }

    /// Join the session hosted by `host`.
    pub fn join(&mut self, host: PeerId) -> Result<(), NetError> {
        self.session.join(host)?;
        match self.transport.connect(host) {
            Ok(handle) => {
                debug!("Dialing {} on {}", host, handle);
                self.dialing = Some(handle);
                self.tiles.hold_remote_edits();
                Ok(())
            }
            Err(err) => {
                self.session.leave();
                Err(err)
            }
        }
    }

    /// Leave the session, closing every connection.
    pub fn leave(&mut self) {
        let was_active = self.session.state() != SessionState::Disconnected;
        let was_peer = matches!(
            self.session.state(),
            SessionState::Joining | SessionState::Connected(Role::Peer)
        );
        if let Some(handle) = self.dialing.take() {
            self.transport.close(handle);
        }
        for handle in self.session.leave() {
            self.queue.purge(handle);
            self.transport.close(handle);
        }
        for (handle, _) in self.rejected.drain(..) {
            self.transport.close(handle);
        }
        self.reassembler.abandon("left session");
        self.entities.clear();
        if was_peer {
            self.tiles.clear();
        }
        if was_active {
            self.events.push(NetEvent::SessionEnded);
        }
    }

    /// Install the authoritative world (host) or an offline world.
    ///
    /// A host with connected peers re-sends the new world to each of them.
    pub fn load_world(&mut self, metadata: WorldMetadata, tiles: TileMap) -> Result<(), NetError> {
        if matches!(
            self.session.state(),
            SessionState::Joining | SessionState::Connected(Role::Peer)
        ) {
            return Err(NetError::NotHost);
        }
        info!("Loaded world '{}' with {} tiles", metadata.name, tiles.len());
        self.tiles.replace_world(metadata, tiles);

        if self.session.is_host() {
            let peers: Vec<PeerId> = self.session.participants().iter().map(|p| p.peer).collect();
            for peer in peers {
                self.send_world_to(peer)?;
            }
        }
        Ok(())
    }

    /// Edit one tile as the local player.
    pub fn set_tile(&mut self, key: TileKey, state: TileState) -> Result<(), NetError> {
        let actor = Actor::new(self.session.local_peer(), self.session.local_name());
        let effects = self.tiles.set_local(self.session.is_host(), key, state, actor)?;
        self.apply(effects);
        Ok(())
    }

    /// Replace a tile's instance state; it is sent with the next dirty flush.
    pub fn update_tile(&mut self, key: TileKey, state: TileState) {
        self.tiles.update_local(key, state);
    }

    /// Mark a tile the simulation changed; it is sent with the next dirty flush.
    pub fn mark_tile_dirty(&mut self, key: TileKey) {
        self.tiles.mark_dirty(key);
    }

    /// Spawn a locally owned entity and announce it.
    pub fn spawn_entity(&mut self, snapshot: NetworkEntitySnapshot) -> Result<NetworkId, NetError> {
        let (network_id, effects) =
            self.entities
                .spawn_local(self.session.is_host(), self.session.local_peer(), snapshot)?;
        self.apply(effects);
        Ok(network_id)
    }

    /// Publish new state for an entity.
    pub fn update_entity(&mut self, snapshot: NetworkEntitySnapshot) -> Result<(), NetError> {
        let effects = self.entities.update_local(self.session.is_host(), snapshot)?;
        self.apply(effects);
        Ok(())
    }

    /// Remove an entity and announce the removal.
    pub fn kill_entity(&mut self, network_id: NetworkId) -> Result<(), NetError> {
        let effects = self.entities.kill_local(self.session.is_host(), network_id)?;
        self.apply(effects);
        Ok(())
    }

    /// Send a chat line. The host broadcasts it; a peer sends it to the host,
    /// which relays it.
    pub fn send_chat(&mut self, text: impl Into<String>) -> Result<(), NetError> {
        let text = text.into();
        if text.len() > MAX_CHAT_LEN {
            return Err(NetError::Limit {
                kind: protocol::MessageKind::ChatMessage,
                field: "text",
                detail: format!("{} exceeds {}", text.len(), MAX_CHAT_LEN),
            });
        }
        let target = match self.session.role() {
            Some(Role::Host) => Target::ALL,
            Some(Role::Peer) => Target::Host,
            None => return Err(NetError::NotConnected),
        };
        let author = Actor::new(self.session.local_peer(), self.session.local_name());
        self.send_to(target, &Payload::ChatMessage(ChatMessage { author, text }))
    }

    /// Ask the host to send the world again, e.g. after a failed transfer.
    pub fn request_world(&mut self) -> Result<(), NetError> {
        match self.session.state() {
            SessionState::Joining | SessionState::Connected(Role::Peer) => {
                self.send_to(Target::Host, &Payload::WorldRequest(WorldRequest))
            }
            SessionState::Connected(Role::Host) => {
                Err(NetError::InvalidState("the host owns the world".into()))
            }
            _ => Err(NetError::NotConnected),
        }
    }

    /// Run one network tick against the wall clock.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Run one network tick at `now`.
    ///
    /// Order: transport events, inbound dispatch, transfer timeout, dirty
    /// tile flush, queue drain.
    #[instrument(level = "debug", skip_all, fields(peer = %self.session.local_peer(), tick = self.tick.0))]
    pub fn tick_at(&mut self, now: Instant) {
        self.tick = self.tick.advance(1);
        self.close_expired_rejections(now);

        while let Some((handle, peer)) = self.transport.accept() {
            self.on_incoming(now, handle, peer);
        }
        for event in self.transport.poll_events() {
            self.on_transport_event(event);
        }

        let inbound = self.transport.poll_receive(self.config.max_receive_batch);
        if !inbound.is_empty() {
            trace!("Dispatching {} inbound messages", inbound.len());
        }
        for (handle, frame) in inbound {
            let tag = frame.first().copied();
            if let Err(err) = self.dispatch(now, handle, frame) {
                let sender = self.session.peer_for(handle);
                let kind = tag.and_then(protocol::MessageKind::from_u8);
                warn!(%handle, ?sender, ?kind, "Dropped inbound message: {}", err);
            }
        }

        if let Err(error) = self.reassembler.check_timeout(now) {
            self.on_transfer_failed(error);
        }

        match self.tiles.flush_dirty(self.session.is_host()) {
            Ok(effects) => self.apply(effects),
            Err(err) => warn!("Dirty tile flush failed: {}", err),
        }

        let report = self.queue.drain_at(now, &mut self.transport);
        if report.rate_limited || report.failed > 0 {
            debug!(
                "Drain sent {} failed {} rate_limited {} remaining {}",
                report.sent, report.failed, report.rate_limited, report.remaining
            );
        }
    }

    fn on_incoming(&mut self, now: Instant, handle: ConnectionHandle, peer: PeerId) {
        match self.session.on_incoming(handle, peer) {
            Ok(()) => {}
            Err(NetError::HandshakeRejected(reason)) => self.reject(now, handle, &reason),
            Err(err) => {
                debug!("Refusing connection {} from {}: {}", handle, peer, err);
                self.transport.close(handle);
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { handle, peer } => {
                if self.dialing == Some(handle) {
                    self.dialing = None;
                }
                match self.session.on_connected(handle, peer) {
                    Some(handshake) => {
                        if let Err(err) = self.send_handshake(handle, handshake) {
                            warn!("Could not queue handshake to {}: {}", peer, err);
                        }
                    }
                    None => self.transport.close(handle),
                }
            }
            TransportEvent::Disconnected { handle } => self.on_link_lost(handle),
        }
    }

    fn send_handshake(&mut self, handle: ConnectionHandle, handshake: Handshake) -> Result<(), NetError> {
        let message = encode(&Payload::Handshake(handshake))?;
        self.queue.enqueue(handle, message);
        Ok(())
    }

    fn on_link_lost(&mut self, handle: ConnectionHandle) {
        let purged = self.queue.purge(handle);
        if self.dialing == Some(handle) {
            self.dialing = None;
            if self.session.state() == SessionState::Joining {
                warn!("Could not connect to host");
                self.session.leave();
                self.tiles.clear();
                self.events.push(NetEvent::SessionEnded);
                return;
            }
        }
        let was_host = self.session.is_host();
        let was_validated = self
            .session
            .peer_for(handle)
            .and_then(|peer| self.session.link(peer))
            .map(|link| link.validated)
            .unwrap_or(false);
        let Some(peer) = self.session.on_disconnected(handle) else {
            return;
        };
        if purged > 0 {
            debug!("Discarded {} queued messages for {}", purged, peer);
        }

        if was_host {
            if !was_validated {
                return;
            }
            self.events.push(NetEvent::PeerLeft { peer });
            if let Err(err) = self.send_to(Target::ALL, &Payload::PeerLeft(protocol::PeerLeft { peer })) {
                warn!("Could not announce departure of {}: {}", peer, err);
            }
            match self.entities.on_peer_disconnected(true, peer) {
                Ok(effects) => self.apply(effects),
                Err(err) => warn!("Entity eviction for {} failed: {}", peer, err),
            }
        } else if self.session.state() == SessionState::Disconnected {
            if self.reassembler.abandon("host disconnected") {
                self.on_transfer_failed(TransferError::Disconnected);
            }
            self.entities.clear();
            self.events.push(NetEvent::SessionEnded);
        }
    }

    /// Answer a refused joiner and close the link once the answer had time
    /// to arrive.
    fn reject(&mut self, now: Instant, handle: ConnectionHandle, reason: &str) {
        warn!("Rejecting {}: {}", handle, reason);
        let welcome = Welcome {
            accepted: false,
            reason: Some(truncate(reason, MAX_REASON_LEN)),
            host: self.session.local_peer(),
            host_name: self.session.local_name().to_string(),
            participants: Vec::new(),
        };
        match encode(&Payload::Welcome(welcome)) {
            Ok(message) => {
                if let Err(err) = self.queue.send_immediate(&mut self.transport, handle, &message) {
                    debug!("Rejection to {} not delivered: {}", handle, err);
                }
                self.queue.flush(&mut self.transport, handle);
            }
            Err(err) => warn!("Could not encode rejection: {}", err),
        }
        self.session.forget(handle);
        self.queue.purge(handle);
        self.rejected.push((handle, now));
    }

    fn close_expired_rejections(&mut self, now: Instant) {
        let (expired, waiting): (Vec<_>, Vec<_>) = self
            .rejected
            .drain(..)
            .partition(|(_, at)| now.saturating_duration_since(*at) >= REJECT_GRACE);
        self.rejected = waiting;
        for (handle, _) in expired {
            self.transport.close(handle);
        }
    }

    fn dispatch(&mut self, now: Instant, handle: ConnectionHandle, frame: Vec<u8>) -> Result<(), NetError> {
        let (message, payload) = decode_frame(frame)?;
        let kind = message.kind();
        let sender = self.session.authorize(handle, kind)?;
        trace!("{} from {} ({} bytes)", kind.as_str(), sender, message.len());

        let is_host = self.session.is_host();
        match (SessionManager::route(kind), payload) {
            (Route::Session, Payload::Handshake(handshake)) => self.on_handshake(now, handle, handshake),
            (Route::Session, Payload::Welcome(welcome)) => self.on_welcome(handle, welcome),
            (Route::Session, Payload::PeerJoined(msg)) => {
                self.session.on_peer_joined(&msg.participant);
                self.events.push(NetEvent::PeerJoined {
                    peer: msg.participant.peer,
                    name: msg.participant.name,
                });
                Ok(())
            }
            (Route::Session, Payload::PeerLeft(msg)) => {
                self.session.on_peer_left(msg.peer);
                self.events.push(NetEvent::PeerLeft { peer: msg.peer });
                Ok(())
            }
            (Route::Chat, Payload::ChatMessage(msg)) => self.on_chat(sender, msg),
            (Route::Transfer, Payload::WorldTransferStart(msg)) => {
                self.tiles.hold_remote_edits();
                self.events.push(NetEvent::TransferStarted {
                    name: msg.metadata.name.clone(),
                    total_chunks: msg.metadata.total_chunks,
                });
                let outcome = self.reassembler.on_start_at(now, msg.metadata);
                self.on_chunk_outcome(outcome)
            }
            (Route::Transfer, Payload::WorldChunk(chunk)) => {
                let outcome = self.reassembler.on_chunk_at(now, chunk);
                self.on_chunk_outcome(outcome)
            }
            (Route::Transfer, Payload::WorldTransferComplete(msg)) => {
                self.reassembler.on_complete(msg.total_chunks);
                Ok(())
            }
            (Route::Transfer, Payload::WorldRequest(_)) => self.send_world_to(sender),
            (Route::Entity, Payload::EntitySpawned(msg)) => {
                let effects = self.entities.on_spawned(is_host, sender, msg)?;
                self.apply(effects);
                Ok(())
            }
            (Route::Entity, Payload::EntityPositionUpdate(msg)) => {
                let effects = self.entities.on_position_update(is_host, sender, msg)?;
                self.apply(effects);
                Ok(())
            }
            (Route::Entity, Payload::EntityKilled(msg)) => {
                let effects = self.entities.on_killed(is_host, sender, msg)?;
                self.apply(effects);
                Ok(())
            }
            (Route::Tile, Payload::TileChanged(msg)) => {
                let effects = self.tiles.on_tile_changed(is_host, sender, msg)?;
                self.apply(effects);
                Ok(())
            }
            (Route::Tile, Payload::TileUpdated(msg)) => {
                let effects = self.tiles.on_tile_updated(is_host, sender, msg)?;
                self.apply(effects);
                Ok(())
            }
            (route, payload) => Err(NetError::InvalidState(format!(
                "{} routed to {:?}",
                payload.kind().as_str(),
                route
            ))),
        }
    }

    /// Host side: validate, welcome, announce, then send the world.
    #[instrument(level = "debug", skip(self, now, handshake), fields(joiner = %handshake.peer_id))]
    fn on_handshake(&mut self, now: Instant, handle: ConnectionHandle, handshake: Handshake) -> Result<(), NetError> {
        let participant = match self.session.on_handshake(handle, &handshake) {
            Ok(participant) => participant,
            Err(NetError::HandshakeRejected(reason)) => {
                self.reject(now, handle, &reason);
                return Err(NetError::HandshakeRejected(reason));
            }
            // A validated link keeps its registration; the repeat is dropped.
            Err(err) => return Err(err),
        };
        let peer = participant.peer;

        let welcome = self.session.welcome_for(peer);
        self.send_to(Target::Peer(peer), &Payload::Welcome(welcome))?;
        self.send_to(
            Target::all_except(peer),
            &Payload::PeerJoined(PeerJoined {
                participant: participant.clone(),
            }),
        )?;
        self.events.push(NetEvent::PeerJoined {
            peer,
            name: participant.name,
        });
        self.send_world_to(peer)
    }

    fn on_welcome(&mut self, handle: ConnectionHandle, welcome: Welcome) -> Result<(), NetError> {
        if self.session.on_welcome(handle, &welcome)? {
            for participant in &welcome.participants {
                self.events.push(NetEvent::PeerJoined {
                    peer: participant.peer,
                    name: participant.name.clone(),
                });
            }
            self.events.push(NetEvent::SessionStarted { role: Role::Peer });
        } else {
            self.queue.purge(handle);
            self.transport.close(handle);
            self.reassembler.abandon("join rejected");
            self.tiles.clear();
            self.events.push(NetEvent::JoinRejected {
                reason: welcome.reason.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn on_chat(&mut self, sender: PeerId, msg: ChatMessage) -> Result<(), NetError> {
        if !self.session.is_host() {
            self.events.push(NetEvent::Chat {
                author: msg.author.peer,
                name: msg.author.name,
                text: msg.text,
            });
            return Ok(());
        }

        // The host attributes relayed lines to the connection they came from.
        let name = self.session.name_of(sender).unwrap_or_default().to_string();
        self.events.push(NetEvent::Chat {
            author: sender,
            name: name.clone(),
            text: msg.text.clone(),
        });
        self.send_to(
            Target::all_except(sender),
            &Payload::ChatMessage(ChatMessage {
                author: Actor::new(sender, name),
                text: msg.text,
            }),
        )
    }

    fn on_chunk_outcome(&mut self, outcome: Result<ChunkOutcome, TransferError>) -> Result<(), NetError> {
        match outcome {
            Ok(ChunkOutcome::Complete(world)) => {
                let metadata = world.metadata.clone();
                let replayed = self.tiles.install_world(world.metadata, world.tiles)?;
                self.events.push(NetEvent::WorldLoaded { metadata });
                self.apply(replayed);
                Ok(())
            }
            Ok(ChunkOutcome::Early) => {
                self.tiles.hold_remote_edits();
                Ok(())
            }
            Ok(ChunkOutcome::Pending { .. } | ChunkOutcome::Duplicate) => Ok(()),
            Err(error) => {
                self.on_transfer_failed(error.clone());
                Err(error.into())
            }
        }
    }

    /// Surface a failed transfer and apply held edits to the world we have.
    fn on_transfer_failed(&mut self, error: TransferError) {
        self.events.push(NetEvent::TransferFailed { error });
        match self.tiles.release_held() {
            Ok(effects) => self.apply(effects),
            Err(err) => warn!("Could not apply held tile edits: {}", err),
        }
    }

    /// Push the current world and the entity catch-up to `peer`.
    fn send_world_to(&mut self, peer: PeerId) -> Result<(), NetError> {
        let handle = self
            .session
            .link(peer)
            .map(|link| link.handle)
            .ok_or(NetError::Unreachable(peer))?;
        let template = self
            .tiles
            .metadata()
            .cloned()
            .unwrap_or_else(|| WorldMetadata::new("untitled", 0, 0));
        let plan = WorldTransferPlan::build(&template, self.tiles.tiles(), self.config.max_tiles_per_chunk);
        let stats: TransferStats =
            send_world(&plan, &mut self.queue, &mut self.transport, handle, &self.config)?;

        for payload in self.entities.catch_up() {
            self.queue.enqueue(handle, encode(&payload)?);
        }
        self.events.push(NetEvent::WorldSent {
            peer,
            chunks: stats.chunks,
        });
        Ok(())
    }

    fn send_to(&mut self, target: Target, payload: &Payload) -> Result<(), NetError> {
        let message = encode(payload)?;
        for handle in self.session.resolve(&target) {
            self.queue.enqueue(handle, message.clone());
        }
        Ok(())
    }

    fn apply(&mut self, effects: Effects) {
        for outbound in effects.outbound {
            for handle in self.session.resolve(&outbound.target) {
                self.queue.enqueue(handle, outbound.message.clone());
            }
        }
        self.events.extend(effects.events);
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, MemoryTransport};
    use crate::protocol::PROTOCOL_VERSION;
    use tilesync_core::{TileLayer, Vec2};

    const HOST: PeerId = PeerId(1);
    const ALICE: PeerId = PeerId(2);

    fn node(net: &MemoryNetwork, peer: PeerId, name: &str) -> NetSubsystem<MemoryTransport> {
        NetSubsystem::new(peer, name, NetConfig::for_tests(), net.endpoint(peer)).expect("subsystem")
    }

    fn small_world() -> (WorldMetadata, TileMap) {
        let mut tiles = TileMap::new();
        for x in 0..40 {
            tiles.set(TileKey::new(x, 5, TileLayer::Ground), TileState::new(1));
        }
        tiles.set(TileKey::new(3, 4, TileLayer::Liquid), TileState::with_data(7, vec![8]));
        (WorldMetadata::new("meadow", 64, 16), tiles)
    }

    /// Tick every node in order, advancing a virtual clock 16 ms per round.
    fn run(nodes: &mut [&mut NetSubsystem<MemoryTransport>], rounds: usize) {
        let mut now = Instant::now();
        for _ in 0..rounds {
            now += Duration::from_millis(16);
            for node in nodes.iter_mut() {
                node.tick_at(now);
            }
        }
    }

    #[test]
    fn test_join_receives_world() {
        let net = MemoryNetwork::with_seed(3);
        let mut host = node(&net, HOST, "host");
        let mut alice = node(&net, ALICE, "alice");
        let (meta, tiles) = small_world();
        host.load_world(meta, tiles.clone()).expect("load");
        host.start_hosting().expect("host");
        alice.join(HOST).expect("join");

        run(&mut [&mut host, &mut alice], 6);

        assert_eq!(alice.session().state(), SessionState::Connected(Role::Peer));
        assert_eq!(alice.tiles().tiles(), &tiles);
        let events = alice.drain_events();
        assert!(events.contains(&NetEvent::SessionStarted { role: Role::Peer }));
        assert!(events.iter().any(|e| matches!(e, NetEvent::WorldLoaded { metadata } if metadata.name == "meadow")));
        assert!(host
            .drain_events()
            .iter()
            .any(|e| matches!(e, NetEvent::WorldSent { peer, .. } if *peer == ALICE)));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let net = MemoryNetwork::with_seed(3);
        let mut host = node(&net, HOST, "host");
        host.start_hosting().expect("host");

        let mut raw = net.endpoint(ALICE);
        let handle = raw.connect(HOST).expect("connect");
        let hello = encode(&Payload::Handshake(Handshake {
            version: PROTOCOL_VERSION + 1,
            schema_hash: crate::codec::compute_schema_hash(),
            peer_id: ALICE,
            display_name: "alice".into(),
        }))
        .expect("encode");
        assert_eq!(raw.send(handle, hello.as_frame()), crate::transport::SendOutcome::Ok);

        host.tick();
        let replies: Vec<Payload> = raw
            .poll_receive(16)
            .into_iter()
            .map(|(_, frame)| decode_frame(frame).expect("decode").1)
            .collect();
        match replies.as_slice() {
            [Payload::Welcome(welcome)] => {
                assert!(!welcome.accepted);
                assert!(welcome.reason.as_deref().unwrap_or("").contains("protocol version"));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert_eq!(host.session().validated_count(), 0);
    }

    #[test]
    fn test_chat_relay_is_attributed_by_host() {
        let net = MemoryNetwork::with_seed(3);
        let mut host = node(&net, HOST, "host");
        let mut alice = node(&net, ALICE, "alice");
        let mut bob = node(&net, PeerId(3), "bob");
        host.start_hosting().expect("host");
        alice.join(HOST).expect("join");
        bob.join(HOST).expect("join");
        run(&mut [&mut host, &mut alice, &mut bob], 6);
        alice.drain_events();
        bob.drain_events();

        alice.send_chat("hello").expect("chat");
        run(&mut [&mut alice, &mut host, &mut bob], 3);

        let chat = NetEvent::Chat {
            author: ALICE,
            name: "alice".into(),
            text: "hello".into(),
        };
        assert!(bob.drain_events().contains(&chat));
        assert!(!alice.drain_events().iter().any(|e| matches!(e, NetEvent::Chat { .. })));
    }

    #[test]
    fn test_entity_spawn_reaches_late_joiner() {
        let net = MemoryNetwork::with_seed(3);
        let mut host = node(&net, HOST, "host");
        host.start_hosting().expect("host");
        let snapshot = NetworkEntitySnapshot::new(4, NetworkId::generate(), Vec2::new(2.0, 3.0));
        let id = host.spawn_entity(snapshot).expect("spawn");

        let mut alice = node(&net, ALICE, "alice");
        alice.join(HOST).expect("join");
        run(&mut [&mut host, &mut alice], 6);

        let record = alice.entities().get(id).expect("caught up");
        assert_eq!(record.owner, HOST);
        assert_eq!(record.snapshot.local_id, 4);
    }

    #[test]
    fn test_chat_requires_session() {
        let net = MemoryNetwork::with_seed(3);
        let mut alice = node(&net, ALICE, "alice");
        assert!(matches!(alice.send_chat("hi"), Err(NetError::NotConnected)));
        assert!(matches!(
            alice.send_chat("x".repeat(MAX_CHAT_LEN + 1)),
            Err(NetError::Limit { .. })
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 10), "short");
    }
}
