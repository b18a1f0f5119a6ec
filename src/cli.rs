//! # Command Line Interface
//!
//! Thin front end over the library.
//!
//! ## Commands
//!
//! - `init` - Write a default configuration
//! - `id` - Print the NodeId derived from the configured address
//! - `run` - Start the endpoint and sync engine, dial bootstrap peers, and run
//!   until Ctrl-C

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::authority::HttpAuthority;
use crate::config::Config;
use crate::p2p::Peer;
use crate::storage::VersionStore;
use crate::sync::{self, SyncEngine};

#[derive(Parser)]
#[command(name = "sharenet")]
#[command(about = "Peer overlay and database synchronization node")]
#[command(version = "1.0.0")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Address to bind and advertise
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
        /// Base URL of the sync authority
        #[arg(long)]
        authority: Option<String>,
        /// Peers to dial at startup, as host:port
        #[arg(long = "bootstrap")]
        bootstrap: Vec<String>,
    },

    /// Print this node's id
    Id,

    /// Run the node until interrupted
    Run,
}

async fn load(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from(&path).await,
        None => Config::load().await,
    }
}

pub async fn init(
    config_path: Option<PathBuf>,
    host: String,
    port: u16,
    authority: Option<String>,
    bootstrap: Vec<String>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => Config::init_at(&path).await?,
        None => Config::init().await?,
    };
    config.host = host;
    config.port = port;
    config.authority_url = authority;
    config.bootstrap_peers = bootstrap;
    config.save().await?;
    info!("Configuration written to {}", config.config_path().display());

    println!("{} sharenet initialized", "✓".green().bold());
    println!("Config:  {}", config.config_path().display());
    println!("Node ID: {}", config.node_id());
    Ok(())
}

pub async fn show_id(config_path: Option<PathBuf>) -> Result<()> {
    let config = load(config_path).await?;
    println!("{}", config.node_id());
    Ok(())
}

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = load(config_path).await?;

    let mut peer = Peer::bind(&config.host, config.port, config.network.clone())
        .await
        .context("Failed to start endpoint")?;
    let store = VersionStore::open(
        &config.data_dir(),
        peer.id().clone(),
        config.sync.versioned_tables.clone(),
    )
    .await
    .context("Failed to open version store")?;

    sync::register_handlers(&mut peer, store.clone());
    peer.start()?;

    for address in config.bootstrap_addresses() {
        match peer.connect(&address.host, address.port).await {
            Ok(id) => info!("Bootstrap peer {} at {} is online", id.short(), address),
            Err(e) => warn!("Failed to reach bootstrap peer {}: {}", address, e),
        }
    }

    let mut engine = SyncEngine::new(store.clone(), config.sync.clone()).with_peer(peer.handle());
    if let Some(url) = &config.authority_url {
        info!("Using sync authority at {}", url);
        engine = engine.with_authority(Arc::new(HttpAuthority::new(
            url,
            config.network.request_timeout(),
        )));
    }
    engine.start();

    println!(
        "{} node {} listening on {}",
        "▶".green().bold(),
        peer.id().short().cyan(),
        peer.local_addr()
    );
    println!(
        "  version: {}",
        store.current_version_hash().unwrap_or_else(|| "(empty)".to_string())
    );

    tokio::signal::ctrl_c().await?;
    println!("{}", "Shutting down...".yellow());

    engine.stop().await;
    peer.stop().await;
    Ok(())
}
