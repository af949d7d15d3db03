//! Weftnet Node Daemon
//!
//! Runs one peer of the overlay: the primary dispatcher carrying
//! collaboration traffic plus the lookup overlay instance used for
//! tunneling around blocked paths.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use weftnet_core::{CoreConfig, Dispatcher, OverlayEvent};
use weftnet_crypto::{NodeIdentity, SessionKey};
use weftnet_net::Packet;
use weftnet_routing::{Contact, FirewallState};

/// Weftnet overlay node
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Primary overlay UDP listen address
    #[arg(short, long, default_value = "0.0.0.0:52180")]
    listen: String,

    /// Primary overlay TCP (proxy) listen address
    #[arg(long, default_value = "0.0.0.0:52181")]
    tcp_listen: String,

    /// Lookup overlay UDP listen address
    #[arg(long, default_value = "0.0.0.0:52182")]
    lookup_listen: String,

    /// Lookup overlay TCP listen address
    #[arg(long, default_value = "0.0.0.0:52183")]
    lookup_tcp_listen: String,

    /// Bootstrap peers (comma-separated host:port)
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Identity file path
    #[arg(short, long)]
    identity: Option<String>,

    /// Display name announced to peers
    #[arg(short, long, default_value = "weftnet-peer")]
    name: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Weftnet node...");

    // Load or generate identity (64 bytes: signing key then encryption
    // key).
    let identity = if let Some(path) = &args.identity {
        if std::path::Path::new(path).exists() {
            let data = std::fs::read(path)?;
            if data.len() != 64 {
                return Err(anyhow::anyhow!("Invalid identity file format"));
            }
            let mut signing_key = [0u8; 32];
            let mut encryption_key = [0u8; 32];
            signing_key.copy_from_slice(&data[..32]);
            encryption_key.copy_from_slice(&data[32..]);
            NodeIdentity::from_keys(signing_key, encryption_key)
                .map_err(|e| anyhow::anyhow!("Failed to load identity: {}", e))?
        } else {
            let identity = NodeIdentity::generate();
            let (signing_key, encryption_key) = identity.export_secrets();
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&signing_key);
            data.extend_from_slice(&encryption_key);
            std::fs::write(path, &data)?;
            info!("Generated new identity and saved to {}", path);
            identity
        }
    } else {
        info!("No identity file specified, generating ephemeral identity");
        NodeIdentity::generate()
    };

    info!("Peer ID: {}", identity.peer_id());

    let listen: SocketAddr = args.listen.parse()?;
    let tcp_listen: SocketAddr = args.tcp_listen.parse()?;
    let lookup_listen: SocketAddr = args.lookup_listen.parse()?;
    let lookup_tcp_listen: SocketAddr = args.lookup_tcp_listen.parse()?;

    let config = CoreConfig {
        display_name: args.name.clone(),
        ..Default::default()
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let operation_key = SessionKey::generate();

    // The lookup overlay runs first so the primary can tunnel over it.
    let (lookup, mut lookup_events) = Dispatcher::spawn(
        identity.clone(),
        CoreConfig {
            display_name: format!("{} (lookup)", args.name),
            ..config.clone()
        },
        lookup_listen,
        lookup_tcp_listen,
        operation_key.clone(),
        None,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to start lookup overlay: {}", e))?;

    let (primary, mut events) = Dispatcher::spawn(
        identity.clone(),
        config,
        listen,
        tcp_listen,
        operation_key,
        Some(lookup.clone()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to start primary overlay: {}", e))?;

    info!("Overlays started (primary {}, lookup {})", listen, lookup_listen);

    // Bootstrap: ping the seed addresses; contacts register from the
    // replies.
    if let Some(bootstrap) = &args.bootstrap {
        let local = Contact::new(
            identity.peer_id(),
            identity.client_id(),
            std::net::Ipv4Addr::UNSPECIFIED,
            tcp_listen.port(),
            listen.port(),
            FirewallState::Blocked,
        );
        for addr in bootstrap
            .split(',')
            .filter_map(|s| s.trim().parse::<SocketAddr>().ok())
        {
            info!("Bootstrapping via {}", addr);
            if let Err(e) = primary.send(addr, Packet::ping(&local)).await {
                warn!("Bootstrap ping to {} failed: {}", addr, e);
            }
        }
    }

    // Drain lookup-overlay events; only failures are interesting there.
    tokio::spawn(async move {
        while let Some(event) = lookup_events.recv().await {
            if let OverlayEvent::Unresponsive = event {
                warn!("Lookup overlay unresponsive");
            }
        }
    });

    // Stats loop alongside the application event stream.
    let stats_handle = primary.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            match stats_handle.local_state().await {
                Ok(state) => info!("Connectivity: {:?}", state),
                Err(_) => break,
            }
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            OverlayEvent::Session(session_event) => {
                info!("Session event: {:?}", session_event);
            }
            OverlayEvent::Replication { target } => {
                info!(
                    "Replication push towards {} ({})",
                    target.peer_id,
                    target.udp_addr()
                );
            }
            OverlayEvent::Unresponsive => {
                warn!("Routing table unresponsive; check connectivity");
            }
        }
    }

    Ok(())
}
