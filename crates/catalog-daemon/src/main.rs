//! catalog-daemon: Headless peer for the content catalog mesh.
//!
//! Runs one catalog node with a WebSocket listener, dials the configured
//! peers, persists the catalog as JSON, and reads console commands from
//! stdin.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use catalog_daemon::{Config, Console, Daemon, JsonFileStore};

#[derive(Parser, Debug)]
#[command(name = "catalog-daemon")]
#[command(about = "Content catalog mesh daemon")]
struct Args {
    /// Directory holding config.json and catalog.json
    #[arg(short, long, default_value = "catalog-data")]
    data_dir: PathBuf,

    /// Address to listen on for incoming connections (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Identity announced to peers (overrides config)
    #[arg(long)]
    identity: Option<String>,

    /// Peer to dial, e.g. ws://10.0.0.2:9427 (repeatable, added to config peers)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Send entries as structured JSON instead of the compact binary form
    #[arg(long)]
    json_codec: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(identity) = self.identity {
            config.identity = Some(identity);
        }
        for peer in self.peers {
            if !config.peers.contains(&peer) {
                config.peers.push(peer);
            }
        }
        if self.json_codec {
            config.prefer_binary = false;
        }
    }
}

/// Forward stdin lines to the daemon and print what comes back.
fn spawn_console(console: Console) {
    let Console {
        commands,
        mut output,
    } = console;

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if commands.send(line).is_err() {
                break;
            }
        }
        debug!("stdin closed, console input stopped");
    });

    tokio::spawn(async move {
        while let Some(text) = output.recv().await {
            println!("{text}");
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,catalog_daemon=debug,catalog_core=debug"
    } else {
        "info,catalog_daemon=info,catalog_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting catalog-daemon");
    info!("Data directory: {:?}", args.data_dir);

    let data_dir = args.data_dir.clone();
    let mut config = Config::load(&data_dir)?;
    args.apply(&mut config);
    info!("Listen address: {}", config.listen);

    let store = JsonFileStore::open(&data_dir)
        .with_context(|| format!("Failed to open catalog in {:?}", data_dir))?;

    let (daemon, console) = Daemon::start(&config, Arc::new(store)).await?;
    spawn_console(console);

    info!("Type `help` for commands. Press Ctrl+C to stop.");
    daemon
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    Ok(())
}
