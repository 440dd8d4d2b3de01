//! NearChat terminal node entry point.
//!
//! Loads the configuration, starts a node on the LAN radio, and runs a small
//! line-oriented chat front end until `/quit`, end of input, or Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config_from()     -- $NEARCHAT_CONFIG or the platform config file
//!  └─ ChatNode::new(LanRadio)
//!       ├─ SessionManager    (accept loop, dial tasks)
//!       ├─ PeerResolver      (scan pump)
//!       └─ MessageDispatcher (FIFO worker)
//!  └─ select! { stdin lines, node events, Ctrl-C }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nearchat_node::console::{clock_now, parse_command, render_event, Command, HELP};
use nearchat_node::infrastructure::radio::lan::LanRadio;
use nearchat_node::infrastructure::storage::config::{config_file_path, load_config_from, AppConfig};
use nearchat_node::ChatNode;

fn resolve_config_path() -> Option<PathBuf> {
    std::env::var_os("NEARCHAT_CONFIG")
        .map(PathBuf::from)
        .or_else(|| config_file_path().ok())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match resolve_config_path() {
        Some(path) => load_config_from(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::default(),
    };

    // Initialise structured logging.  `RUST_LOG` overrides the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(name = %config.node.name, "NearChat starting");

    let radio = Arc::new(LanRadio::new(config.lan_radio_config()?));
    let (node, mut events) = ChatNode::new(radio, &config);
    node.start().context("starting the listener")?;

    println!("NearChat as \"{}\". Type /help for commands.", node.name());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if !handle_line(&node, &line) {
                    break;
                }
            }
            Some(event) = events.recv() => {
                if let Some(text) = render_event(&event, &clock_now()) {
                    println!("{text}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    node.stop();
    info!("NearChat stopped");
    Ok(())
}

/// Executes one input line.  Returns `false` when the user asked to quit.
fn handle_line(node: &ChatNode, line: &str) -> bool {
    match parse_command(line) {
        Command::Send { destination, text } => {
            if let Err(e) = node.send(destination, text) {
                println!("{} >> {e}", clock_now());
            }
        }
        Command::Peers => {
            let peers = node.known_peers();
            if peers.is_empty() {
                println!("no peers known yet, try /scan");
            }
            for peer in peers {
                println!("  {} ({})", peer.display_name, peer.address);
            }
        }
        Command::Scan => {
            node.scan();
        }
        Command::State => {
            println!(
                "state: {} ({} send(s) pending)",
                node.state(),
                node.pending_sends()
            );
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
        Command::Empty => {}
        Command::Unknown(text) => {
            warn!(%text, "unrecognised input");
            println!("unrecognised input, type /help");
        }
    }
    true
}
