//! iccpd - ICCP/MLAG daemon entry point

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sonic_iccpd::{
    IccpConfig, NeighborEvent, RecordingBridge, Role, Session, TcpTransport,
};

/// ICCP port; the active side connects, the standby side listens.
const ICCP_PORT: u16 = 8888;
/// Scheduler tick period.
const TICK_MS: u64 = 100;

#[derive(Debug, Parser)]
#[command(name = "iccpd", about = "ICCP/MLAG synchronization daemon")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/sonic/iccpd.toml")]
    config: PathBuf,

    /// Log verbosity
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

fn init_logging(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Establishes the peer connection according to role: the active side
/// dials out, the standby side accepts.
fn connect(config: &IccpConfig) -> anyhow::Result<TcpStream> {
    match config.role {
        Role::Active => {
            let addr = SocketAddr::from((config.peer_addr, ICCP_PORT));
            info!(%addr, "connecting to peer");
            TcpStream::connect(addr).context("connecting to peer")
        }
        Role::Standby => {
            let addr = SocketAddr::from((config.local_addr, ICCP_PORT));
            info!(%addr, "listening for peer");
            let listener = TcpListener::bind(addr).context("binding ICCP listener")?;
            let (stream, peer) = listener.accept().context("accepting peer connection")?;
            info!(%peer, "peer connected");
            Ok(stream)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level);

    info!("--- Starting iccpd (Rust) ---");

    let config = IccpConfig::load(&args.config).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config; using defaults");
        IccpConfig::default()
    });

    let stream = connect(&config)?;
    let transport = TcpTransport::new(stream)?;

    // Kernel neighbor events arrive over a single-producer channel and
    // are drained on the scheduler thread; until the netlink collector
    // is wired in, the channel simply stays idle.
    let (_event_tx, mut event_rx) = mpsc::channel::<NeighborEvent>(1024);

    // TODO: replace RecordingBridge with the swss-common backed bridge
    // once the orchagent integration lands.
    let mut session = Session::new(config, Box::new(transport), Box::new(RecordingBridge::new()));

    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while let Ok(ev) = event_rx.try_recv() {
                    session.on_neighbor_event(ev);
                }
                session.tick(Instant::now());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    info!(stats = ?session.stats, "iccpd exiting");
    Ok(())
}
