//! wgpilotd - WireGuard peer provisioning and telemetry daemon
//!
//! `run` keeps the interface reconciled and samples traffic until it is
//! signalled; the other subcommands perform one operation and exit.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use wgpilot_wireguard::PrivateKey;
use wgpilotd::keyfile::write_private_key;
use wgpilotd::{EngineConfig, SystemEngine, format_bytes, hours_before};

#[derive(Parser)]
#[command(name = "wgpilotd")]
#[command(about = "WireGuard peer provisioning and traffic telemetry")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(
        short,
        long,
        global = true,
        env = "WGPILOT_CONFIG",
        default_value = "/etc/wgpilot/wgpilot.toml"
    )]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the interface and sample traffic until interrupted
    Run,

    /// Write a config file with default settings
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "wgpilot.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Generate the server key pair
    InitKeys {
        /// Overwrite an existing key
        #[arg(long)]
        force: bool,
    },

    /// Create a peer and print its client config
    CreatePeer {
        /// Display name
        name: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List peers
    ListPeers {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Enable or disable a peer
    TogglePeer {
        /// Peer id
        id: i64,

        /// New state
        #[arg(value_enum)]
        state: PeerState,
    },

    /// Delete a peer and its history
    DeletePeer {
        /// Peer id
        id: i64,
    },

    /// Print a peer's client config
    ShowConfig {
        /// Peer id
        id: i64,
    },

    /// Show live status of every peer
    Stats {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a peer's bandwidth samples
    History {
        /// Peer id
        id: i64,

        /// How many hours back to go
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(i64).range(0..))]
        hours: i64,
    },

    /// Show server settings
    Settings {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Take one bandwidth sample now
    SampleOnce,

    /// Look the public address up again and rewrite client configs
    RefreshEndpoint,
}

#[derive(Clone, Copy, ValueEnum)]
enum PeerState {
    Enable,
    Disable,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Run => run(&cli.config).await?,
        Commands::InitConfig { output, force } => init_config(&output, force)?,
        Commands::InitKeys { force } => init_keys(&cli.config, force)?,
        Commands::CreatePeer { name, json } => {
            let created = engine(&cli.config)?.create_peer(&name).await?;
            if json {
                print_json(&created)?;
            } else {
                eprintln!(
                    "Created peer {} ({}) with address {}",
                    created.peer.id, created.peer.name, created.peer.address
                );
                print!("{}", created.client_config);
            }
        }
        Commands::ListPeers { json } => {
            let peers = engine(&cli.config)?.list_peers()?;
            if json {
                print_json(&peers)?;
            } else {
                println!(
                    "{:<5} {:<24} {:<15} {:<8} {:>12} {:>12}",
                    "ID", "NAME", "ADDRESS", "STATE", "RX", "TX"
                );
                for peer in peers {
                    println!(
                        "{:<5} {:<24} {:<15} {:<8} {:>12} {:>12}",
                        peer.id,
                        peer.name,
                        peer.address,
                        if peer.enabled { "enabled" } else { "disabled" },
                        format_bytes(peer.total_rx),
                        format_bytes(peer.total_tx)
                    );
                }
            }
        }
        Commands::TogglePeer { id, state } => {
            let enabled = matches!(state, PeerState::Enable);
            let peer = engine(&cli.config)?.toggle_peer(id, enabled).await?;
            println!(
                "Peer {} ({}) is now {}",
                peer.id,
                peer.name,
                if peer.enabled { "enabled" } else { "disabled" }
            );
        }
        Commands::DeletePeer { id } => {
            engine(&cli.config)?.delete_peer(id).await?;
            println!("Deleted peer {id}");
        }
        Commands::ShowConfig { id } => {
            print!("{}", engine(&cli.config)?.client_config_text(id).await?);
        }
        Commands::Stats { json } => {
            let stats = engine(&cli.config)?.peer_stats().await?;
            if json {
                print_json(&stats)?;
            } else {
                println!(
                    "{:<5} {:<24} {:<8} {:>12} {:>12}  {}",
                    "ID", "NAME", "STATUS", "RX", "TX", "ENDPOINT"
                );
                for peer in stats {
                    println!(
                        "{:<5} {:<24} {:<8} {:>12} {:>12}  {}",
                        peer.id,
                        peer.name,
                        if peer.online { "online" } else { "offline" },
                        format_bytes(peer.rx_bytes),
                        format_bytes(peer.tx_bytes),
                        peer.endpoint.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::History { id, hours } => {
            let since = hours_before(chrono::Utc::now(), hours)
                .with_context(|| format!("--hours {hours} is out of range"))?;
            let samples = engine(&cli.config)?.bandwidth_history(id, since)?;
            print_json(&samples)?;
        }
        Commands::Settings { json } => {
            let summary = engine(&cli.config)?.settings_summary().await?;
            if json {
                print_json(&summary)?;
            } else {
                println!("Interface:        {}", summary.interface);
                println!("Endpoint:         {}", summary.endpoint);
                println!("Public key:       {}", summary.server_public_key);
                println!("Subnet:           {}", summary.subnet);
                println!(
                    "Primary device:   {}",
                    summary.primary_interface.as_deref().unwrap_or("unknown")
                );
                println!(
                    "Peers:            {} ({} enabled, {} disabled)",
                    summary.peers.total, summary.peers.enabled, summary.peers.disabled
                );
                println!(
                    "Alert thresholds: {} GB/h down, {} GB/h up",
                    summary.download_threshold_gb, summary.upload_threshold_gb
                );
            }
        }
        Commands::SampleOnce => {
            let report = engine(&cli.config)?.sample_once().await?;
            print_json(&report)?;
        }
        Commands::RefreshEndpoint => match engine(&cli.config)?.refresh_endpoint().await? {
            Some(host) => println!("Public endpoint: {host}"),
            None => anyhow::bail!("public address could not be determined"),
        },
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("wgpilotd=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
    Ok(())
}

fn engine(config_path: &Path) -> anyhow::Result<SystemEngine> {
    let config = EngineConfig::from_file(config_path)?;
    SystemEngine::from_config(config).context("failed to initialize engine")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting wgpilotd");
    let engine = engine(config_path)?;
    engine.start().await?;

    shutdown_signal().await?;
    info!("shutdown requested");
    engine.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let config = EngineConfig::default();
    std::fs::write(output, config.to_toml()?)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote default config to {}", output.display());
    Ok(())
}

fn init_keys(config_path: &Path, force: bool) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        EngineConfig::from_file(config_path)?
    } else {
        info!(config = %config_path.display(), "config file not found, using defaults");
        EngineConfig::default()
    };

    let key = PrivateKey::generate()?;
    let path = &config.interface.private_key_path;
    write_private_key(path, &key, force)?;
    println!("Wrote server private key to {}", path.display());
    println!("Public key: {}", key.public_key());
    Ok(())
}
