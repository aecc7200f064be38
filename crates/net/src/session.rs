//! Session state machine, connection registry and message routing.
//!
//! The manager owns the `PeerId ↔ ConnectionHandle` mapping. It never sends
//! anything itself: handshake replies and roster notices are returned to the
//! subsystem, which encodes them and hands them to the outbound queue.

use crate::codec::compute_schema_hash;
use crate::error::NetError;
use crate::protocol::{Handshake, MessageKind, Participant, Welcome, MAX_NAME_LEN, PROTOCOL_VERSION};
use crate::transport::ConnectionHandle;
use std::collections::{BTreeMap, HashMap};
use tilesync_core::PeerId;
use tracing::{debug, info, warn};

/// Role of the local process once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Authoritative process.
    Host,
    /// Non-authoritative participant.
    Peer,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session.
    Disconnected,
    /// Waiting for the platform to confirm session creation.
    Hosting,
    /// Connecting to a host and waiting for its `Welcome`.
    Joining,
    /// In a session.
    Connected(Role),
}

/// Handler family a message kind is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Handshake and roster traffic.
    Session,
    /// Chat lines.
    Chat,
    /// Bulk world transfer.
    Transfer,
    /// Entity replication.
    Entity,
    /// Tile replication.
    Tile,
}

/// Addressing for an outbound message, resolved to handles at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// The host connection (peer role only).
    Host,
    /// One specific participant.
    Peer(PeerId),
    /// Every validated participant except the origin of a relayed message.
    AllPeers {
        /// Participant to skip.
        except: Option<PeerId>,
    },
}

impl Target {
    /// Broadcast to every validated participant.
    pub const ALL: Target = Target::AllPeers { except: None };

    /// Broadcast skipping `origin`.
    pub fn all_except(origin: PeerId) -> Self {
        Target::AllPeers {
            except: Some(origin),
        }
    }
}

/// Registry entry for one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLink {
    /// Transport handle.
    pub handle: ConnectionHandle,
    /// Display name from the handshake (empty until validated).
    pub display_name: String,
    /// Whether the handshake completed.
    pub validated: bool,
}

/// Owns the session state and the connection registry.
#[derive(Debug)]
pub struct SessionManager {
    local: PeerId,
    local_name: String,
    state: SessionState,
    host: Option<PeerId>,
    links: BTreeMap<PeerId, PeerLink>,
    by_handle: HashMap<ConnectionHandle, PeerId>,
    roster: BTreeMap<PeerId, String>,
    schema_hash: u64,
}

impl SessionManager {
    /// Create a disconnected manager for the local identity.
    pub fn new(local: PeerId, local_name: impl Into<String>) -> Self {
        Self {
            local,
            local_name: local_name.into(),
            state: SessionState::Disconnected,
            host: None,
            links: BTreeMap::new(),
            by_handle: HashMap::new(),
            roster: BTreeMap::new(),
            schema_hash: compute_schema_hash(),
        }
    }

    /// Local identity.
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Local display name.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Role once connected.
    pub fn role(&self) -> Option<Role> {
        match self.state {
            SessionState::Connected(role) => Some(role),
            _ => None,
        }
    }

    /// Whether this process is the connected host.
    pub fn is_host(&self) -> bool {
        self.role() == Some(Role::Host)
    }

    /// Begin hosting: `Disconnected → Hosting`.
    pub fn host(&mut self) -> Result<(), NetError> {
        self.transition(SessionState::Disconnected, SessionState::Hosting)?;
        info!("{} starting to host", self.local);
        Ok(())
    }

    /// Platform confirmed the session: `Hosting → Connected(Host)`.
    pub fn on_session_created(&mut self) -> Result<(), NetError> {
        self.transition(SessionState::Hosting, SessionState::Connected(Role::Host))?;
        self.host = Some(self.local);
        info!("{} is hosting", self.local);
        Ok(())
    }

    /// Begin joining `host`: `Disconnected → Joining`.
    pub fn join(&mut self, host: PeerId) -> Result<(), NetError> {
        if host == self.local {
            return Err(NetError::InvalidState("cannot join own session".into()));
        }
        self.transition(SessionState::Disconnected, SessionState::Joining)?;
        self.host = Some(host);
        info!("{} joining {}", self.local, host);
        Ok(())
    }

    /// Leave the session. Returns every handle the caller should close.
    pub fn leave(&mut self) -> Vec<ConnectionHandle> {
        let handles: Vec<ConnectionHandle> = self.by_handle.keys().copied().collect();
        if self.state != SessionState::Disconnected {
            info!("{} leaving session ({} connections)", self.local, handles.len());
        }
        self.reset();
        handles
    }

    /// Outbound connect completed.
    ///
    /// While joining, the connection to the host is registered and the
    /// handshake to send is returned.
    pub fn on_connected(&mut self, handle: ConnectionHandle, peer: PeerId) -> Option<Handshake> {
        if self.state != SessionState::Joining || Some(peer) != self.host {
            warn!("Unexpected outbound connection {} to {}", handle, peer);
            return None;
        }
        self.register(handle, peer);
        // We dialed this host ourselves, so its traffic is trusted before the Welcome.
        if let Some(link) = self.links.get_mut(&peer) {
            link.validated = true;
        }
        debug!("Connected to host {} on {}, sending handshake", peer, handle);
        Some(Handshake {
            version: PROTOCOL_VERSION,
            schema_hash: self.schema_hash,
            peer_id: self.local,
            display_name: self.local_name.clone(),
        })
    }

    /// Incoming connection from `peer`. Only a connected host accepts; the
    /// link stays unvalidated until its handshake passes.
    pub fn on_incoming(&mut self, handle: ConnectionHandle, peer: PeerId) -> Result<(), NetError> {
        if !self.is_host() {
            return Err(NetError::NotHost);
        }
        if let Some(existing) = self.links.get(&peer) {
            return Err(NetError::HandshakeRejected(format!(
                "{} already connected on {}",
                peer, existing.handle
            )));
        }
        self.register(handle, peer);
        debug!("Accepted {} from {}, awaiting handshake", handle, peer);
        Ok(())
    }

    /// Validate a peer's handshake (host side). On success the link is
    /// validated and the joining participant is returned.
    pub fn on_handshake(
        &mut self,
        handle: ConnectionHandle,
        handshake: &Handshake,
    ) -> Result<Participant, NetError> {
        if !self.is_host() {
            return Err(NetError::NotHost);
        }
        let peer = self.peer_for(handle).ok_or(NetError::UnknownConnection(handle))?;
        if self.links.get(&peer).is_some_and(|link| link.validated) {
            return Err(NetError::InvalidState(format!(
                "duplicate handshake from {peer}"
            )));
        }
        if handshake.peer_id != peer {
            return Err(NetError::HandshakeRejected(format!(
                "claimed identity {} does not match connection identity {}",
                handshake.peer_id, peer
            )));
        }
        if handshake.version != PROTOCOL_VERSION {
            return Err(NetError::HandshakeRejected(format!(
                "protocol version {} (host runs {})",
                handshake.version, PROTOCOL_VERSION
            )));
        }
        if handshake.schema_hash != self.schema_hash {
            return Err(NetError::HandshakeRejected(format!(
                "schema hash {:016x} (host has {:016x})",
                handshake.schema_hash, self.schema_hash
            )));
        }
        if handshake.display_name.len() > MAX_NAME_LEN {
            return Err(NetError::HandshakeRejected("display name too long".into()));
        }

        let link = self
            .links
            .get_mut(&peer)
            .ok_or(NetError::UnknownConnection(handle))?;
        link.validated = true;
        link.display_name = handshake.display_name.clone();
        info!("{} ({}) joined", peer, handshake.display_name);
        Ok(Participant {
            peer,
            name: handshake.display_name.clone(),
        })
    }

    /// Build the acceptance reply for `peer`, listing everyone else.
    pub fn welcome_for(&self, peer: PeerId) -> Welcome {
        Welcome {
            accepted: true,
            reason: None,
            host: self.local,
            host_name: self.local_name.clone(),
            participants: self
                .participants()
                .into_iter()
                .filter(|p| p.peer != peer)
                .collect(),
        }
    }

    /// Host's verdict arrived (peer side).
    ///
    /// Returns `true` when admitted. A rejection tears the session down.
    pub fn on_welcome(&mut self, handle: ConnectionHandle, welcome: &Welcome) -> Result<bool, NetError> {
        if self.state != SessionState::Joining {
            return Err(NetError::InvalidState(format!(
                "welcome received while {:?}",
                self.state
            )));
        }
        let host = self.host.ok_or(NetError::NotConnected)?;
        if self.peer_for(handle) != Some(host) || welcome.host != host {
            return Err(NetError::HostOnly(MessageKind::Welcome));
        }

        if !welcome.accepted {
            warn!(
                "Host {} rejected us: {}",
                host,
                welcome.reason.as_deref().unwrap_or("no reason given")
            );
            self.reset();
            return Ok(false);
        }

        if let Some(link) = self.links.get_mut(&host) {
            link.validated = true;
            link.display_name = welcome.host_name.clone();
        }
        self.roster.clear();
        self.roster.insert(host, welcome.host_name.clone());
        for participant in &welcome.participants {
            if participant.peer != self.local {
                self.roster.insert(participant.peer, participant.name.clone());
            }
        }
        self.state = SessionState::Connected(Role::Peer);
        info!(
            "Joined {} ({}) with {} other participants",
            host,
            welcome.host_name,
            welcome.participants.len()
        );
        Ok(true)
    }

    /// Roster notice from the host (peer side).
    pub fn on_peer_joined(&mut self, participant: &Participant) {
        if participant.peer != self.local {
            self.roster.insert(participant.peer, participant.name.clone());
        }
    }

    /// Roster notice from the host (peer side).
    pub fn on_peer_left(&mut self, peer: PeerId) {
        self.roster.remove(&peer);
    }

    /// Connection lost or closed. Returns the participant it belonged to.
    ///
    /// Losing the host connection ends the session.
    pub fn on_disconnected(&mut self, handle: ConnectionHandle) -> Option<PeerId> {
        let peer = self.by_handle.remove(&handle)?;
        self.links.remove(&peer);
        self.roster.remove(&peer);

        if self.role() != Some(Role::Host) && Some(peer) == self.host {
            warn!("Lost connection to host {}", peer);
            self.reset();
        } else {
            info!("{} disconnected ({})", peer, handle);
        }
        Some(peer)
    }

    /// Drop a link without waiting for the transport (e.g. rejected handshake).
    pub fn forget(&mut self, handle: ConnectionHandle) -> Option<PeerId> {
        let peer = self.by_handle.remove(&handle)?;
        self.links.remove(&peer);
        Some(peer)
    }

    /// Handler family for a message kind.
    pub fn route(kind: MessageKind) -> Route {
        match kind {
            MessageKind::Handshake
            | MessageKind::Welcome
            | MessageKind::PeerJoined
            | MessageKind::PeerLeft => Route::Session,
            MessageKind::ChatMessage => Route::Chat,
            MessageKind::WorldTransferStart
            | MessageKind::WorldChunk
            | MessageKind::WorldTransferComplete
            | MessageKind::WorldRequest => Route::Transfer,
            MessageKind::EntitySpawned
            | MessageKind::EntityPositionUpdate
            | MessageKind::EntityKilled => Route::Entity,
            MessageKind::TileChanged | MessageKind::TileUpdated => Route::Tile,
        }
    }

    /// Check that `kind` may arrive on `handle` and return the sender.
    ///
    /// Unvalidated connections may only carry the handshake exchange, and
    /// host-originated kinds are only accepted from the host.
    pub fn authorize(&self, handle: ConnectionHandle, kind: MessageKind) -> Result<PeerId, NetError> {
        let peer = self.peer_for(handle).ok_or(NetError::UnknownConnection(handle))?;
        let validated = self.links.get(&peer).map(|l| l.validated).unwrap_or(false);
        let handshake_kind = matches!(kind, MessageKind::Handshake | MessageKind::Welcome);
        if !validated && !handshake_kind {
            return Err(NetError::NotValidated(handle));
        }

        let host_only = matches!(
            kind,
            MessageKind::Welcome
                | MessageKind::PeerJoined
                | MessageKind::PeerLeft
                | MessageKind::WorldTransferStart
                | MessageKind::WorldChunk
                | MessageKind::WorldTransferComplete
        );
        let to_host_only = matches!(kind, MessageKind::Handshake | MessageKind::WorldRequest);
        if host_only && (self.is_host() || Some(peer) != self.host) {
            return Err(NetError::HostOnly(kind));
        }
        if to_host_only && !self.is_host() {
            return Err(NetError::NotHost);
        }
        Ok(peer)
    }

    /// Expand a target into connection handles.
    pub fn resolve(&self, target: &Target) -> Vec<ConnectionHandle> {
        match target {
            Target::Host => self
                .host
                .filter(|host| *host != self.local)
                .and_then(|host| self.links.get(&host))
                .map(|link| vec![link.handle])
                .unwrap_or_default(),
            Target::Peer(peer) => self
                .links
                .get(peer)
                .map(|link| vec![link.handle])
                .unwrap_or_default(),
            Target::AllPeers { except } => self
                .links
                .iter()
                .filter(|(peer, link)| link.validated && Some(**peer) != *except)
                .map(|(_, link)| link.handle)
                .collect(),
        }
    }

    /// Participant bound to `handle`.
    pub fn peer_for(&self, handle: ConnectionHandle) -> Option<PeerId> {
        self.by_handle.get(&handle).copied()
    }

    /// Registry entry for `peer`.
    pub fn link(&self, peer: PeerId) -> Option<&PeerLink> {
        self.links.get(&peer)
    }

    /// Display name of a known participant (or the local one).
    pub fn name_of(&self, peer: PeerId) -> Option<&str> {
        if peer == self.local {
            return Some(&self.local_name);
        }
        self.links
            .get(&peer)
            .filter(|link| link.validated)
            .map(|link| link.display_name.as_str())
            .or_else(|| self.roster.get(&peer).map(String::as_str))
    }

    /// Other participants known to this process.
    ///
    /// The host lists its validated links; a peer lists what the host told it.
    pub fn participants(&self) -> Vec<Participant> {
        if self.is_host() {
            self.links
                .iter()
                .filter(|(_, link)| link.validated)
                .map(|(peer, link)| Participant {
                    peer: *peer,
                    name: link.display_name.clone(),
                })
                .collect()
        } else {
            self.roster
                .iter()
                .map(|(peer, name)| Participant {
                    peer: *peer,
                    name: name.clone(),
                })
                .collect()
        }
    }

    /// Number of validated connections.
    pub fn validated_count(&self) -> usize {
        self.links.values().filter(|link| link.validated).count()
    }

    fn register(&mut self, handle: ConnectionHandle, peer: PeerId) {
        self.by_handle.insert(handle, peer);
        self.links.insert(
            peer,
            PeerLink {
                handle,
                display_name: String::new(),
                validated: false,
            },
        );
    }

    fn transition(&mut self, from: SessionState, to: SessionState) -> Result<(), NetError> {
        if self.state != from {
            return Err(NetError::InvalidState(format!(
                "{:?} -> {:?} requires {:?}",
                self.state, to, from
            )));
        }
        self.state = to;
        Ok(())
    }

    fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.host = None;
        self.links.clear();
        self.by_handle.clear();
        self.roster.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosting() -> SessionManager {
        let mut session = SessionManager::new(PeerId(1), "host");
        session.host().expect("host");
        session.on_session_created().expect("created");
        session
    }

    fn handshake(peer: u64, name: &str) -> Handshake {
        Handshake {
            version: PROTOCOL_VERSION,
            schema_hash: compute_schema_hash(),
            peer_id: PeerId(peer),
            display_name: name.into(),
        }
    }

    fn admit(session: &mut SessionManager, handle: u64, peer: u64, name: &str) {
        session
            .on_incoming(ConnectionHandle(handle), PeerId(peer))
            .expect("incoming");
        session
            .on_handshake(ConnectionHandle(handle), &handshake(peer, name))
            .expect("handshake");
    }

    #[test]
    fn test_state_transitions() {
        let mut session = SessionManager::new(PeerId(1), "a");
        assert!(session.on_session_created().is_err());
        session.host().expect("host");
        assert_eq!(session.state(), SessionState::Hosting);
        assert!(session.join(PeerId(2)).is_err());
        session.on_session_created().expect("created");
        assert_eq!(session.role(), Some(Role::Host));

        session.leave();
        assert_eq!(session.state(), SessionState::Disconnected);
        session.join(PeerId(2)).expect("join after leave");
        assert_eq!(session.state(), SessionState::Joining);
    }

    #[test]
    fn test_handshake_validation() {
        let mut session = hosting();
        session
            .on_incoming(ConnectionHandle(10), PeerId(5))
            .expect("incoming");

        let mut bad = handshake(5, "eve");
        bad.schema_hash ^= 1;
        assert!(matches!(
            session.on_handshake(ConnectionHandle(10), &bad),
            Err(NetError::HandshakeRejected(_))
        ));

        let spoofed = handshake(6, "eve");
        assert!(session.on_handshake(ConnectionHandle(10), &spoofed).is_err());

        let participant = session
            .on_handshake(ConnectionHandle(10), &handshake(5, "eve"))
            .expect("valid handshake");
        assert_eq!(participant.name, "eve");
        assert_eq!(session.validated_count(), 1);

        // A second handshake on a validated link is refused without
        // disturbing the registered link.
        let mut again = handshake(5, "eve");
        again.version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            session.on_handshake(ConnectionHandle(10), &again),
            Err(NetError::InvalidState(_))
        ));
        assert_eq!(session.peer_for(ConnectionHandle(10)), Some(PeerId(5)));
        assert_eq!(session.name_of(PeerId(5)), Some("eve"));
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let mut session = hosting();
        admit(&mut session, 10, 5, "eve");
        assert!(matches!(
            session.on_incoming(ConnectionHandle(11), PeerId(5)),
            Err(NetError::HandshakeRejected(_))
        ));
        assert_eq!(session.link(PeerId(5)).map(|l| l.handle), Some(ConnectionHandle(10)));
    }

    #[test]
    fn test_broadcast_excludes_origin() {
        let mut session = hosting();
        admit(&mut session, 10, 100, "a");
        admit(&mut session, 11, 101, "b");
        admit(&mut session, 12, 102, "c");
        // Unvalidated connections never receive broadcasts.
        session
            .on_incoming(ConnectionHandle(13), PeerId(103))
            .expect("incoming");

        let mut handles = session.resolve(&Target::all_except(PeerId(100)));
        handles.sort();
        assert_eq!(handles, vec![ConnectionHandle(11), ConnectionHandle(12)]);
        assert_eq!(session.resolve(&Target::ALL).len(), 3);
        assert_eq!(
            session.resolve(&Target::Peer(PeerId(101))),
            vec![ConnectionHandle(11)]
        );
    }

    #[test]
    fn test_authorize_gates_unvalidated_and_host_only_kinds() {
        let mut session = hosting();
        session
            .on_incoming(ConnectionHandle(10), PeerId(5))
            .expect("incoming");
        assert!(matches!(
            session.authorize(ConnectionHandle(10), MessageKind::TileChanged),
            Err(NetError::NotValidated(_))
        ));
        assert_eq!(
            session
                .authorize(ConnectionHandle(10), MessageKind::Handshake)
                .expect("handshake allowed"),
            PeerId(5)
        );
        session
            .on_handshake(ConnectionHandle(10), &handshake(5, "eve"))
            .expect("handshake");
        assert!(matches!(
            session.authorize(ConnectionHandle(10), MessageKind::WorldChunk),
            Err(NetError::HostOnly(MessageKind::WorldChunk))
        ));
        assert!(session
            .authorize(ConnectionHandle(10), MessageKind::TileChanged)
            .is_ok());
        assert!(matches!(
            session.authorize(ConnectionHandle(99), MessageKind::ChatMessage),
            Err(NetError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_peer_join_flow_and_host_loss() {
        let mut session = SessionManager::new(PeerId(7), "pat");
        session.join(PeerId(1)).expect("join");
        let hs = session
            .on_connected(ConnectionHandle(3), PeerId(1))
            .expect("handshake to send");
        assert_eq!(hs.peer_id, PeerId(7));
        assert_eq!(session.resolve(&Target::Host), vec![ConnectionHandle(3)]);

        let welcome = Welcome {
            accepted: true,
            reason: None,
            host: PeerId(1),
            host_name: "host".into(),
            participants: vec![Participant {
                peer: PeerId(8),
                name: "quinn".into(),
            }],
        };
        assert!(session.on_welcome(ConnectionHandle(3), &welcome).expect("welcome"));
        assert_eq!(session.role(), Some(Role::Peer));
        assert_eq!(session.participants().len(), 2);
        assert_eq!(session.name_of(PeerId(8)), Some("quinn"));

        assert_eq!(session.on_disconnected(ConnectionHandle(3)), Some(PeerId(1)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.participants().is_empty());
    }

    #[test]
    fn test_rejected_welcome_disconnects() {
        let mut session = SessionManager::new(PeerId(7), "pat");
        session.join(PeerId(1)).expect("join");
        session.on_connected(ConnectionHandle(3), PeerId(1));
        let welcome = Welcome {
            accepted: false,
            reason: Some("full".into()),
            host: PeerId(1),
            host_name: "host".into(),
            participants: Vec::new(),
        };
        assert!(!session.on_welcome(ConnectionHandle(3), &welcome).expect("verdict"));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_route_table() {
        assert_eq!(SessionManager::route(MessageKind::WorldChunk), Route::Transfer);
        assert_eq!(SessionManager::route(MessageKind::TileUpdated), Route::Tile);
        assert_eq!(SessionManager::route(MessageKind::EntityKilled), Route::Entity);
        assert_eq!(SessionManager::route(MessageKind::ChatMessage), Route::Chat);
        assert_eq!(SessionManager::route(MessageKind::PeerLeft), Route::Session);
    }

    #[test]
    fn test_welcome_lists_other_participants() {
        let mut session = hosting();
        admit(&mut session, 10, 100, "a");
        admit(&mut session, 11, 101, "b");
        let welcome = session.welcome_for(PeerId(101));
        assert_eq!(welcome.host, PeerId(1));
        assert_eq!(
            welcome.participants,
            vec![Participant {
                peer: PeerId(100),
                name: "a".into()
            }]
        );
    }
}
