//! tilesync - host-authoritative tile world replication
//!
//! Command line front end: host a generated world over QUIC, join a host,
//! or run a whole session in-process over the memory transport.

mod config;
mod world_gen;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{AppConfig, DEFAULT_CONFIG_PATH};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tilesync_core::{PeerId, TileKey, TileLayer, TileState};
use tilesync_net::{
    MemoryNetwork, NetEvent, NetSubsystem, QuicTransport, Role, SessionState, Transport,
};
use tracing::{error, info, warn};

const TICK: Duration = Duration::from_millis(16);

#[derive(Parser, Debug)]
#[command(author, version, about = "Multiplayer tile world replication", long_about = None)]
struct Cli {
    /// Path of the TOML config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a generated world and accept peers
    Host(HostArgs),
    /// Join a running host
    Join(JoinArgs),
    /// Run a host and peers in one process over the memory transport
    Loopback(LoopbackArgs),
}

#[derive(Args, Debug, Clone)]
struct WorldArgs {
    /// World name announced to peers
    #[arg(long, default_value = "demo")]
    name: String,

    /// World width in tiles
    #[arg(long, default_value_t = 128)]
    width: u32,

    /// World height in tiles
    #[arg(long, default_value_t = 64)]
    height: u32,

    /// Generator seed
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

#[derive(Args, Debug)]
struct HostArgs {
    /// Override the `[quic] bind` address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Stop after this many ticks (default: run until interrupted)
    #[arg(long)]
    ticks: Option<u64>,

    #[command(flatten)]
    world: WorldArgs,
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// Peer id of the host
    #[arg(long)]
    host_id: u64,

    /// Address the host listens on
    #[arg(long)]
    addr: SocketAddr,

    /// Local address to bind (default: any port)
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Chat line to send once joined
    #[arg(long)]
    say: Option<String>,

    /// Stop after this many ticks (default: run until the session ends)
    #[arg(long)]
    ticks: Option<u64>,
}

#[derive(Args, Debug)]
struct LoopbackArgs {
    /// Number of peers
    #[arg(long, default_value_t = 3)]
    peers: usize,

    /// Ticks to run after everyone joined
    #[arg(long, default_value_t = 300)]
    ticks: u64,

    /// Tile edits each peer attempts per second of simulated time
    #[arg(long, default_value_t = 4)]
    edits_per_second: u32,

    #[command(flatten)]
    world: WorldArgs,
}

fn main() -> Result<()> {
    // Initialize tracing with INFO level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting tilesync v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = AppConfig::load_from_path(&cli.config);
    match cli.command {
        Command::Host(args) => run_host(config, args),
        Command::Join(args) => run_join(config, args),
        Command::Loopback(args) => run_loopback(config, args),
    }
}

fn run_host(mut config: AppConfig, args: HostArgs) -> Result<()> {
    if let Some(bind) = args.bind {
        config.quic.bind = bind;
    }
    let local = config.identity.resolve_peer();
    let transport = QuicTransport::bind(local, config.quic.clone())?;
    let addr = transport.local_addr()?;
    let mut net = NetSubsystem::new(local, config.identity.display_name.clone(), config.net, transport)
        .context("Failed to create network subsystem")?;

    let (metadata, tiles) =
        world_gen::generate(&args.world.name, args.world.width, args.world.height, args.world.seed);
    info!(
        "Generated '{}' ({}x{}, {} tiles)",
        metadata.name,
        metadata.width,
        metadata.height,
        tiles.len()
    );
    net.start_hosting()?;
    net.load_world(metadata, tiles)?;
    info!("Hosting as {} on {}; join with --host-id {} --addr {}", local, addr, local.0, addr);

    run_loop(&mut net, args.ticks, |_, _| false);
    net.leave();
    Ok(())
}

fn run_join(config: AppConfig, args: JoinArgs) -> Result<()> {
    let local = config.identity.resolve_peer();
    let host = PeerId(args.host_id);
    if host == local {
        bail!("host id {} equals the local peer id", host);
    }

    let mut quic = config.quic.clone();
    quic.bind = args.bind;
    let mut transport = QuicTransport::bind(local, quic)?;
    transport.add_peer_address(host, args.addr);

    let mut net = NetSubsystem::new(local, config.identity.display_name.clone(), config.net, transport)
        .context("Failed to create network subsystem")?;
    net.join(host)
        .with_context(|| format!("Failed to join {} at {}", host, args.addr))?;
    info!("Joining {} at {}", host, args.addr);

    let mut greeting = args.say;
    run_loop(&mut net, args.ticks, |net, event| {
        if let NetEvent::SessionStarted { role: Role::Peer } = event {
            if let Some(text) = greeting.take() {
                if let Err(err) = net.send_chat(text) {
                    warn!("Failed to send chat: {err}");
                }
            }
        }
        matches!(event, NetEvent::SessionEnded | NetEvent::JoinRejected { .. })
    });
    net.leave();
    Ok(())
}

/// Tick at a fixed rate until `stop` returns true for an event or the tick
/// limit is reached.
fn run_loop<T: Transport>(
    net: &mut NetSubsystem<T>,
    limit: Option<u64>,
    mut stop: impl FnMut(&mut NetSubsystem<T>, &NetEvent) -> bool,
) {
    let mut next = Instant::now();
    let mut ticks = 0u64;
    loop {
        net.tick();
        for event in net.drain_events() {
            log_event(net.local_peer(), &event);
            if stop(net, &event) {
                return;
            }
        }

        ticks += 1;
        if limit.is_some_and(|limit| ticks >= limit) {
            info!("Tick limit {} reached", ticks);
            return;
        }
        next += TICK;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }
    }
}

fn log_event(local: PeerId, event: &NetEvent) {
    match event {
        NetEvent::SessionStarted { role } => info!("{} session started as {:?}", local, role),
        NetEvent::JoinRejected { reason } => error!("{} join rejected: {}", local, reason),
        NetEvent::SessionEnded => info!("{} session ended", local),
        NetEvent::PeerJoined { peer, name } => info!("{} joined ({})", peer, name),
        NetEvent::PeerLeft { peer } => info!("{} left", peer),
        NetEvent::Chat { name, text, .. } => info!("<{}> {}", name, text),
        NetEvent::TransferStarted { name, total_chunks } => {
            info!("Receiving '{}' in {} chunks", name, total_chunks)
        }
        NetEvent::WorldLoaded { metadata } => info!(
            "World '{}' loaded: {} tiles, checksum {:08x}",
            metadata.name, metadata.tile_count, metadata.checksum
        ),
        NetEvent::TransferFailed { error } => warn!("{} world transfer failed: {}", local, error),
        NetEvent::WorldSent { peer, chunks } => info!("Sent world to {} ({} chunks)", peer, chunks),
        other => tracing::debug!("{} {:?}", local, other),
    }
}

fn run_loopback(config: AppConfig, args: LoopbackArgs) -> Result<()> {
    let network = MemoryNetwork::with_seed(args.world.seed);
    let host_id = PeerId(1);
    let mut host = NetSubsystem::new(host_id, "host", config.net.clone(), network.endpoint(host_id))?;
    let (metadata, tiles) =
        world_gen::generate(&args.world.name, args.world.width, args.world.height, args.world.seed);
    host.start_hosting()?;
    host.load_world(metadata, tiles)?;

    let mut peers = Vec::with_capacity(args.peers);
    for index in 0..args.peers {
        let id = PeerId(100 + index as u64);
        let mut peer = NetSubsystem::new(
            id,
            format!("peer{index}"),
            config.net.clone(),
            network.endpoint(id),
        )?;
        peer.join(host_id)?;
        peers.push(peer);
    }

    let mut now = Instant::now();
    let mut joined = false;
    for _ in 0..2_000 {
        step(&mut now, &mut host, &mut peers);
        joined = peers.iter().all(|peer| {
            peer.session().state() == SessionState::Connected(Role::Peer)
                && peer.tiles().metadata().is_some()
                && peer.transfer_progress().is_none()
        });
        if joined {
            break;
        }
    }
    if !joined {
        bail!("peers did not finish joining");
    }
    info!("{} peers joined", peers.len());

    let mut rng = StdRng::seed_from_u64(args.world.seed);
    let (width, height) = (args.world.width.max(1) as i32, args.world.height.max(1) as i32);
    let edit_chance = f64::from(args.edits_per_second) * TICK.as_secs_f64();
    let mut edits = 0u64;
    for _ in 0..args.ticks {
        for peer in peers.iter_mut() {
            if rng.gen_bool(edit_chance.clamp(0.0, 1.0)) {
                let key = TileKey::new(rng.gen_range(0..width), rng.gen_range(0..height), TileLayer::Ground);
                let state = if rng.gen_bool(0.3) {
                    TileState::air()
                } else {
                    TileState::new(rng.gen_range(1..=3))
                };
                if peer.set_tile(key, state).is_ok() {
                    edits += 1;
                }
            }
        }
        step(&mut now, &mut host, &mut peers);
    }
    // Let in-flight edits settle.
    for _ in 0..120 {
        step(&mut now, &mut host, &mut peers);
    }

    let expected = host.tiles().tiles().checksum();
    let mut diverged = 0;
    for peer in &peers {
        let checksum = peer.tiles().tiles().checksum();
        if checksum != expected {
            warn!("{} diverged: {:08x} != {:08x}", peer.local_peer(), checksum, expected);
            diverged += 1;
        }
    }
    let metrics = host.queue_metrics();
    info!(
        "Loopback done: {} edits, {} messages sent by host, {} rate limited, {} diverged",
        edits, metrics.sent, metrics.rate_limited, diverged
    );
    for peer in &mut peers {
        peer.leave();
    }
    host.leave();
    if diverged > 0 {
        bail!("{} of {} peers ended with a different world", diverged, peers.len());
    }
    Ok(())
}

/// One virtual tick: host first, then peers in order.
fn step<T: Transport>(now: &mut Instant, host: &mut NetSubsystem<T>, peers: &mut [NetSubsystem<T>]) {
    *now += TICK;
    host.tick_at(*now);
    for peer in peers.iter_mut() {
        peer.tick_at(*now);
    }
}
