//! QUIC transport using quinn, with self-signed TLS for development.
//!
//! Every connection carries one unidirectional stream per direction. A
//! stream opens with [`PROTOCOL_MAGIC`] and the sender's [`PeerId`], then
//! carries length-prefixed frames, so frames on one connection arrive in
//! send order. Network I/O runs on a runtime owned by the transport; its
//! results cross back to the tick thread over a channel and are surfaced by
//! the polling methods of [`Transport`].

use crate::error::NetError;
use crate::protocol::PROTOCOL_MAGIC;
use crate::transport::{ConnectionHandle, SendOutcome, Transport, TransportEvent};
use anyhow::{bail, Context, Result};
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tilesync_core::PeerId;
use tokio::runtime::Runtime;
use tokio::sync::mpsc as async_mpsc;
use tracing::{debug, info, trace, warn};

const ALPN: &[u8] = b"tilesync";
const HEADER_LEN: usize = 16;
/// Frames above this size close the connection.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Settings for [`QuicTransport`], read from the `[quic]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicConfig {
    /// Local UDP address.
    pub bind: SocketAddr,
    /// Frames a connection may buffer before sends report `RateLimited`.
    pub max_in_flight: usize,
    /// Keep-alive ping interval.
    pub keep_alive_ms: u64,
    /// Idle time after which a silent connection is dropped.
    pub idle_timeout_ms: u64,
    /// Longest a flush blocks waiting for buffered frames.
    pub flush_timeout_ms: u64,
    /// TLS server name presented when dialing.
    pub server_name: String,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 7777)),
            max_in_flight: 64,
            keep_alive_ms: 5_000,
            idle_timeout_ms: 30_000,
            flush_timeout_ms: 1_000,
            server_name: "localhost".into(),
        }
    }
}

/// Writer half of a live connection.
struct Link {
    peer: PeerId,
    connection: Connection,
    outbox: async_mpsc::Sender<Vec<u8>>,
    in_flight: Arc<AtomicUsize>,
}

/// Results reported by runtime tasks.
enum Inbound {
    Opened {
        handle: ConnectionHandle,
        link: Link,
        outgoing: bool,
    },
    DialFailed {
        handle: ConnectionHandle,
        peer: PeerId,
        reason: String,
    },
    Frame {
        handle: ConnectionHandle,
        frame: Vec<u8>,
    },
    Closed {
        handle: ConnectionHandle,
        reason: String,
    },
}

/// [`Transport`] over QUIC.
pub struct QuicTransport {
    local: PeerId,
    config: QuicConfig,
    endpoint: Endpoint,
    addresses: HashMap<PeerId, SocketAddr>,
    links: HashMap<ConnectionHandle, Link>,
    abandoned: HashSet<ConnectionHandle>,
    next_handle: Arc<AtomicU64>,
    tx: mpsc::Sender<Inbound>,
    rx: mpsc::Receiver<Inbound>,
    incoming: VecDeque<(ConnectionHandle, PeerId)>,
    events: Vec<TransportEvent>,
    inbox: VecDeque<(ConnectionHandle, Vec<u8>)>,
    // Declared last: dropped after the endpoint.
    runtime: Runtime,
}

impl QuicTransport {
    /// Bind an endpoint that both accepts and dials connections.
    pub fn bind(local: PeerId, config: QuicConfig) -> Result<Self> {
        // Install default crypto provider if not already installed
        let _ = rustls::crypto::ring::default_provider().install_default();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tilesync-quic")
            .enable_all()
            .build()
            .context("Failed to start QUIC runtime")?;

        let endpoint = {
            let _guard = runtime.enter();
            let mut endpoint = Endpoint::server(server_config(&config)?, config.bind)
                .context("Failed to bind QUIC endpoint")?;
            endpoint.set_default_client_config(client_config(&config)?);
            endpoint
        };
        info!("{} listening on {}", local, endpoint.local_addr()?);

        let (tx, rx) = mpsc::channel();
        let next_handle = Arc::new(AtomicU64::new(0));
        runtime.spawn(accept_loop(
            endpoint.clone(),
            local,
            next_handle.clone(),
            config.max_in_flight,
            tx.clone(),
        ));

        Ok(Self {
            local,
            config,
            endpoint,
            addresses: HashMap::new(),
            links: HashMap::new(),
            abandoned: HashSet::new(),
            next_handle,
            tx,
            rx,
            incoming: VecDeque::new(),
            events: Vec::new(),
            inbox: VecDeque::new(),
            runtime,
        })
    }

    /// Identity announced to remote endpoints.
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Record where `peer` can be dialed.
    pub fn add_peer_address(&mut self, peer: PeerId, addr: SocketAddr) {
        self.addresses.insert(peer, addr);
    }

    fn allocate(&self) -> ConnectionHandle {
        ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Move task results into the polled queues.
    fn pump(&mut self) {
        while let Ok(inbound) = self.rx.try_recv() {
            match inbound {
                Inbound::Opened {
                    handle,
                    link,
                    outgoing,
                } => {
                    if self.abandoned.remove(&handle) {
                        link.connection.close(0u32.into(), b"closed");
                        continue;
                    }
                    let peer = link.peer;
                    debug!(%handle, %peer, outgoing, "QUIC link open");
                    self.links.insert(handle, link);
                    if outgoing {
                        self.events.push(TransportEvent::Connected { handle, peer });
                    } else {
                        self.incoming.push_back((handle, peer));
                    }
                }
                Inbound::DialFailed { handle, peer, reason } => {
                    self.abandoned.remove(&handle);
                    warn!("Could not reach {}: {}", peer, reason);
                    self.events.push(TransportEvent::Disconnected { handle });
                }
                Inbound::Frame { handle, frame } => {
                    if self.links.contains_key(&handle) {
                        self.inbox.push_back((handle, frame));
                    }
                }
                Inbound::Closed { handle, reason } => {
                    if let Some(link) = self.links.remove(&handle) {
                        debug!(%handle, peer = %link.peer, "QUIC link closed: {}", reason);
                        self.events.push(TransportEvent::Disconnected { handle });
                    }
                }
            }
        }
    }
}

impl Transport for QuicTransport {
    fn connect(&mut self, peer: PeerId) -> Result<ConnectionHandle, NetError> {
        let addr = *self.addresses.get(&peer).ok_or(NetError::Unreachable(peer))?;
        let handle = self.allocate();
        let endpoint = self.endpoint.clone();
        let server_name = self.config.server_name.clone();
        let capacity = self.config.max_in_flight;
        let local = self.local;
        let tx = self.tx.clone();
        debug!(%peer, %addr, %handle, "Dialing");

        self.runtime.spawn(async move {
            match dial(&endpoint, addr, &server_name, local, peer).await {
                Ok((connection, send, recv)) => {
                    let link = spawn_writer(peer, connection, send, handle, capacity);
                    let opened = Inbound::Opened {
                        handle,
                        link,
                        outgoing: true,
                    };
                    if tx.send(opened).is_ok() {
                        spawn_reader(recv, handle, tx);
                    }
                }
                Err(err) => {
                    let _ = tx.send(Inbound::DialFailed {
                        handle,
                        peer,
                        reason: format!("{err:#}"),
                    });
                }
            }
        });
        Ok(handle)
    }

    fn accept(&mut self) -> Option<(ConnectionHandle, PeerId)> {
        self.pump();
        self.incoming.pop_front()
    }

    fn send(&mut self, handle: ConnectionHandle, frame: &[u8]) -> SendOutcome {
        let Some(link) = self.links.get(&handle) else {
            return SendOutcome::Failed(format!("no link {handle}"));
        };
        link.in_flight.fetch_add(1, Ordering::AcqRel);
        match link.outbox.try_send(frame.to_vec()) {
            Ok(()) => {
                trace!(%handle, bytes = frame.len(), "Queued frame");
                SendOutcome::Ok
            }
            Err(async_mpsc::error::TrySendError::Full(_)) => {
                link.in_flight.fetch_sub(1, Ordering::AcqRel);
                SendOutcome::RateLimited
            }
            Err(async_mpsc::error::TrySendError::Closed(_)) => {
                link.in_flight.fetch_sub(1, Ordering::AcqRel);
                SendOutcome::Failed(format!("{handle} closed"))
            }
        }
    }

    fn flush(&mut self, handle: ConnectionHandle) {
        let Some(link) = self.links.get(&handle) else {
            return;
        };
        let in_flight = link.in_flight.clone();
        let limit = Duration::from_millis(self.config.flush_timeout_ms);
        let drained = self.runtime.block_on(async move {
            tokio::time::timeout(limit, async {
                while in_flight.load(Ordering::Acquire) > 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .is_ok()
        });
        if !drained {
            debug!(%handle, "Flush timed out after {:?}", limit);
        }
    }

    fn poll_receive(&mut self, max: usize) -> Vec<(ConnectionHandle, Vec<u8>)> {
        self.pump();
        let take = max.min(self.inbox.len());
        self.inbox.drain(..take).collect()
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        self.pump();
        std::mem::take(&mut self.events)
    }

    fn close(&mut self, handle: ConnectionHandle) {
        match self.links.remove(&handle) {
            Some(link) => {
                debug!(%handle, peer = %link.peer, "Closing QUIC link");
                link.connection.close(0u32.into(), b"closed");
            }
            None => {
                self.abandoned.insert(handle);
            }
        }
        self.inbox.retain(|(h, _)| *h != handle);
        self.incoming.retain(|(h, _)| *h != handle);
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"shutting down");
    }
}

fn transport_config(config: &QuicConfig) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_millis(config.keep_alive_ms)));
    transport.max_idle_timeout(Some(Duration::from_millis(config.idle_timeout_ms).try_into()?));
    Ok(transport)
}

fn server_config(config: &QuicConfig) -> Result<ServerConfig> {
    let (cert, key) = generate_self_signed_cert()?;
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .context("Failed to build rustls ServerConfig")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("Failed to create QuicServerConfig")?,
    ));
    server.transport_config(Arc::new(transport_config(config)?));
    Ok(server)
}

fn client_config(config: &QuicConfig) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("Failed to create QuicClientConfig")?,
    ));
    client.transport_config(Arc::new(transport_config(config)?));
    Ok(client)
}

/// Self-signed certificate for `localhost`. Development only.
fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("Failed to generate certificate")?;
    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    Ok((CertificateDer::from(cert.cert), key))
}

fn identity_header(peer: PeerId) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..8].copy_from_slice(PROTOCOL_MAGIC);
    header[8..].copy_from_slice(&peer.0.to_le_bytes());
    header
}

async fn read_identity(recv: &mut RecvStream) -> Result<PeerId> {
    let mut header = [0u8; HEADER_LEN];
    recv.read_exact(&mut header)
        .await
        .context("Failed to read identity header")?;
    if header[..8] != PROTOCOL_MAGIC[..] {
        bail!("protocol magic mismatch");
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&header[8..]);
    Ok(PeerId(u64::from_le_bytes(id)))
}

async fn dial(
    endpoint: &Endpoint,
    addr: SocketAddr,
    server_name: &str,
    local: PeerId,
    expected: PeerId,
) -> Result<(Connection, SendStream, RecvStream)> {
    let connection = endpoint
        .connect(addr, server_name)
        .context("Failed to initiate connection")?
        .await
        .context("Failed to establish connection")?;
    let mut send = connection.open_uni().await.context("Failed to open stream")?;
    send.write_all(&identity_header(local)).await?;
    let mut recv = connection.accept_uni().await.context("Failed to accept stream")?;
    let announced = read_identity(&mut recv).await?;
    if announced != expected {
        connection.close(0u32.into(), b"identity mismatch");
        bail!("{addr} announced {announced}, expected {expected}");
    }
    Ok((connection, send, recv))
}

async fn accept_one(incoming: quinn::Incoming, local: PeerId) -> Result<(PeerId, Connection, SendStream, RecvStream)> {
    let connection = incoming.await.context("QUIC handshake failed")?;
    let mut recv = connection.accept_uni().await.context("Failed to accept stream")?;
    let peer = read_identity(&mut recv).await?;
    let mut send = connection.open_uni().await.context("Failed to open stream")?;
    send.write_all(&identity_header(local)).await?;
    Ok((peer, connection, send, recv))
}

async fn accept_loop(
    endpoint: Endpoint,
    local: PeerId,
    handles: Arc<AtomicU64>,
    capacity: usize,
    tx: mpsc::Sender<Inbound>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let handles = handles.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match accept_one(incoming, local).await {
                Ok((peer, connection, send, recv)) => {
                    let handle = ConnectionHandle(handles.fetch_add(1, Ordering::Relaxed) + 1);
                    let link = spawn_writer(peer, connection, send, handle, capacity);
                    let opened = Inbound::Opened {
                        handle,
                        link,
                        outgoing: false,
                    };
                    if tx.send(opened).is_ok() {
                        spawn_reader(recv, handle, tx);
                    }
                }
                Err(err) => debug!("Dropped incoming connection: {:#}", err),
            }
        });
    }
    debug!("Accept loop finished");
}

fn spawn_writer(
    peer: PeerId,
    connection: Connection,
    send: SendStream,
    handle: ConnectionHandle,
    capacity: usize,
) -> Link {
    let (outbox, rx) = async_mpsc::channel(capacity.max(1));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let counter = in_flight.clone();
    let writer_connection = connection.clone();
    tokio::spawn(async move {
        if let Err(err) = write_frames(send, rx, counter).await {
            debug!(%handle, "Writer stopped: {:#}", err);
            writer_connection.close(0u32.into(), b"write failed");
        }
    });
    Link {
        peer,
        connection,
        outbox,
        in_flight,
    }
}

fn spawn_reader(recv: RecvStream, handle: ConnectionHandle, tx: mpsc::Sender<Inbound>) {
    tokio::spawn(async move {
        let reason = match read_frames(recv, handle, &tx).await {
            Ok(()) => "stream finished".to_string(),
            Err(err) => format!("{err:#}"),
        };
        let _ = tx.send(Inbound::Closed { handle, reason });
    });
}

async fn write_frames(
    mut send: SendStream,
    mut outbox: async_mpsc::Receiver<Vec<u8>>,
    in_flight: Arc<AtomicUsize>,
) -> Result<()> {
    while let Some(frame) = outbox.recv().await {
        let len = u32::try_from(frame.len()).context("frame too large")?;
        send.write_all(&len.to_le_bytes()).await?;
        send.write_all(&frame).await?;
        in_flight.fetch_sub(1, Ordering::AcqRel);
    }
    send.finish()?;
    Ok(())
}

async fn read_frames(mut recv: RecvStream, handle: ConnectionHandle, tx: &mpsc::Sender<Inbound>) -> Result<()> {
    loop {
        let mut len = [0u8; 4];
        recv.read_exact(&mut len).await?;
        let len = u32::from_le_bytes(len) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            bail!("invalid frame length {len}");
        }
        let mut frame = vec![0u8; len];
        recv.read_exact(&mut frame).await?;
        if tx.send(Inbound::Frame { handle, frame }).is_err() {
            // Transport dropped.
            return Ok(());
        }
    }
}

/// Certificate verifier that accepts all certificates (development only).
///
/// **WARNING:** This bypasses TLS security and should NEVER be used in production.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn localhost() -> QuicConfig {
        QuicConfig {
            bind: "127.0.0.1:0".parse().expect("valid address"),
            ..QuicConfig::default()
        }
    }

    fn wait_for<T>(what: &str, mut poll: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Some(value) = poll() {
                return value;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn test_dial_unknown_peer_fails() {
        let mut transport = QuicTransport::bind(PeerId(1), localhost()).expect("bind");
        assert!(matches!(
            transport.connect(PeerId(9)),
            Err(NetError::Unreachable(PeerId(9)))
        ));
    }

    #[test]
    fn test_localhost_round_trip() {
        let mut host = QuicTransport::bind(PeerId(1), localhost()).expect("host bind");
        let mut peer = QuicTransport::bind(PeerId(2), localhost()).expect("peer bind");
        peer.add_peer_address(PeerId(1), host.local_addr().expect("host addr"));

        let handle = peer.connect(PeerId(1)).expect("dial");
        let event = wait_for("connect", || peer.poll_events().into_iter().next());
        assert_eq!(
            event,
            TransportEvent::Connected {
                handle,
                peer: PeerId(1)
            }
        );
        let (host_handle, from) = wait_for("accept", || host.accept());
        assert_eq!(from, PeerId(2));

        for i in 0..3u8 {
            assert_eq!(peer.send(handle, &[11, i]), SendOutcome::Ok);
        }
        peer.flush(handle);
        let mut frames = Vec::new();
        wait_for("frames", || {
            frames.extend(host.poll_receive(16).into_iter().map(|(_, f)| f));
            (frames.len() == 3).then_some(())
        });
        assert_eq!(frames, vec![vec![11, 0], vec![11, 1], vec![11, 2]]);

        assert_eq!(host.send(host_handle, &[11, 9]), SendOutcome::Ok);
        let (_, reply) = wait_for("reply", || peer.poll_receive(1).pop());
        assert_eq!(reply, vec![11, 9]);

        peer.close(handle);
        let lost = wait_for("disconnect", || host.poll_events().into_iter().next());
        assert_eq!(lost, TransportEvent::Disconnected { handle: host_handle });
    }
}
