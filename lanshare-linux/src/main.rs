// LanShare for Linux: discovery, transfer daemon and a small CLI.

mod config;
mod discovery;
mod identity;
mod transport;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lanshare_core::{
    Engine, PeerState, RegistryEvent, SessionHandle, SessionOptions, SessionStatus,
    TransferEvent, PROTOCOL_VERSION,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::discovery::{Beacon, LanDiscovery};

#[derive(Parser)]
#[command(name = "lanshare", version, about = "Share files with devices on your LAN")]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Announce this device and accept incoming transfers
    Daemon,
    /// List devices seen on the network
    Peers {
        /// Seconds to listen before printing
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
    /// Send a file to a peer
    Send {
        /// Peer device id (see `lanshare peers`)
        peer: String,
        file: PathBuf,
        /// Seconds to wait for the peer to show up
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = config::load()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Daemon => run_daemon(cfg).await,
            Command::Peers { wait } => list_peers(cfg, Duration::from_secs(wait)).await,
            Command::Send { peer, file, wait } => {
                send(cfg, &peer, file, Duration::from_secs(wait)).await
            }
        }
    })
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Engine plus running discovery, shared by every subcommand.
async fn start(cfg: &config::Config) -> anyhow::Result<(Engine, LanDiscovery)> {
    let device_id = identity::load_or_create(&config::state_dir())?;
    let engine = Engine::new(cfg.engine.clone(), device_id.clone())?;
    let local = Beacon {
        protocol_version: PROTOCOL_VERSION,
        device_id,
        name: cfg.device_name.clone().unwrap_or_default(),
        model: discovery::local_model(),
        kind: cfg.device_kind.clone(),
        listen_port: cfg.transport_port,
        goodbye: false,
    };
    let lan = LanDiscovery::start(engine.discovery().clone(), local, cfg.discovery_port)
        .with_context(|| format!("joining discovery on UDP port {}", cfg.discovery_port))?;
    Ok((engine, lan))
}

async fn run_daemon(cfg: config::Config) -> anyhow::Result<()> {
    let (engine, lan) = start(&cfg).await?;
    let sweeper = engine.spawn_sweeper();

    let save_dir = cfg.engine.save_path.clone();
    tokio::fs::create_dir_all(&save_dir)
        .await
        .with_context(|| format!("creating {}", save_dir.display()))?;
    let listener = TcpListener::bind(("0.0.0.0", cfg.transport_port))
        .await
        .with_context(|| format!("binding TCP port {}", cfg.transport_port))?;
    let server = tokio::spawn(transport::serve(listener, engine.clone(), save_dir));
    let logger = tokio::spawn(log_events(engine.clone()));

    shutdown_signal().await?;
    info!("shutting down");
    for session in engine.transfers().list_sessions().await {
        if !session.status.is_terminal() {
            if let Ok(handle) = engine.transfers().session(session.id).await {
                let _ = handle.cancel().await;
            }
        }
    }
    server.abort();
    logger.abort();
    sweeper.abort();
    lan.shutdown().await;
    Ok(())
}

async fn log_events(engine: Engine) {
    let mut peers = engine.discovery().subscribe();
    let mut transfers = engine.transfers().subscribe();
    loop {
        tokio::select! {
            ev = peers.recv() => match ev {
                Ok(RegistryEvent::PeerAdded(p)) => {
                    info!(peer = %p.id, name = %p.display_name, kind = %p.kind, addr = %p.address, "peer joined")
                }
                Ok(RegistryEvent::PeerUpdated(p)) if p.state == PeerState::Offline => {
                    info!(peer = %p.id, "peer went offline")
                }
                Ok(RegistryEvent::PeerRemoved { id }) => info!(peer = %id, "peer forgotten"),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "peer event log lagged"),
                Err(RecvError::Closed) => break,
            },
            ev = transfers.recv() => match ev {
                Ok(TransferEvent::SessionCreated { id, direction, peer_id, file_name, total_bytes }) => {
                    info!(session = %id, ?direction, peer = %peer_id, file = %file_name, bytes = total_bytes, "transfer created")
                }
                Ok(TransferEvent::StatusChanged { id, status, reason }) => match reason {
                    Some(r) => warn!(session = %id, %status, reason = %r, "transfer status"),
                    None => info!(session = %id, %status, "transfer status"),
                },
                Ok(TransferEvent::Progress { .. }) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "transfer event log lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn list_peers(cfg: config::Config, wait: Duration) -> anyhow::Result<()> {
    let (engine, lan) = start(&cfg).await?;
    tokio::time::sleep(wait).await;
    let peers = engine.discovery().snapshot().await;
    lan.shutdown().await;

    if peers.is_empty() {
        println!("no peers found");
        return Ok(());
    }
    println!("{:<38} {:<20} {:<8} {:<22} STATE", "ID", "NAME", "KIND", "ADDRESS");
    for p in peers {
        let state = match p.state {
            PeerState::Online => "online",
            PeerState::Offline => "offline",
        };
        println!(
            "{:<38} {:<20} {:<8} {:<22} {}",
            p.id,
            p.display_name,
            p.kind.to_string(),
            p.address.to_string(),
            state
        );
    }
    Ok(())
}

async fn send(
    cfg: config::Config,
    peer: &str,
    file: PathBuf,
    wait: Duration,
) -> anyhow::Result<()> {
    let (engine, lan) = start(&cfg).await?;
    let result = send_with_progress(&engine, peer, file, wait).await;
    lan.shutdown().await;
    result
}

async fn send_with_progress(
    engine: &Engine,
    peer: &str,
    file: PathBuf,
    wait: Duration,
) -> anyhow::Result<()> {
    let found = tokio::time::timeout(wait, async {
        loop {
            match engine.discovery().get(peer).await {
                Some(p) if p.state == PeerState::Online => break,
                _ => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
    })
    .await;
    if found.is_err() {
        anyhow::bail!("peer {peer} not found on the network");
    }

    let mut events = engine.transfers().subscribe();
    let handle = transport::send_file(engine, peer, file, SessionOptions::default()).await?;
    let info = handle.info().await;
    let bar = progress_bar(info.total_bytes, &info.file_name);

    let status = tokio::select! {
        status = follow(&handle, &mut events, &bar) => status,
        res = shutdown_signal() => {
            res?;
            handle.cancel().await?;
            SessionStatus::Cancelled
        }
    };
    match status {
        SessionStatus::Completed => {
            bar.finish_with_message(format!("Sent {}", info.file_name));
            Ok(())
        }
        _ => {
            bar.abandon();
            match handle.info().await.last_error {
                Some(reason) => anyhow::bail!("transfer {status}: {reason}"),
                None => anyhow::bail!("transfer {status}"),
            }
        }
    }
}

/// Drive the progress bar until the session ends.
async fn follow(
    handle: &SessionHandle,
    events: &mut tokio::sync::broadcast::Receiver<TransferEvent>,
    bar: &ProgressBar,
) -> SessionStatus {
    loop {
        tokio::select! {
            status = handle.wait() => return status,
            ev = events.recv() => match ev {
                Ok(TransferEvent::Progress { id, bytes_transferred, .. }) if id == handle.id() => {
                    bar.set_position(bytes_transferred)
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return handle.wait().await,
            },
        }
    }
}

fn progress_bar(total_bytes: u64, file_name: &str) -> ProgressBar {
    let bar = ProgressBar::new(total_bytes);
    let style = ProgressStyle::default_bar()
        .template("{msg}\n[{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    bar.set_style(style);
    bar.set_message(format!("Sending {file_name}"));
    bar
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
