//! group-daemon: A group messaging node over TCP.
//!
//! Runs the full interceptor stack on a TCP transport with a static peer
//! list. Lines typed on stdin are sent to every verified member; received
//! messages and membership changes are logged.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use group_core::{
    ChannelConfig, ChannelError, ChannelListener, ChannelMessage, ErrorHandler, GroupChannel,
    Member, MembershipListener, SendOptions, StartFlags, UniqueId,
};
use group_daemon::{TcpTransport, parse_member};

#[derive(Parser, Debug)]
#[command(name = "group-daemon")]
#[command(about = "Group messaging node over TCP")]
struct Args {
    /// Address to listen on (also this node's identity)
    #[arg(short, long, default_value = "127.0.0.1:4000")]
    listen: String,

    /// Peer address (host:port), repeatable
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// Logs everything that reaches the application end.
struct LogListener;

impl ChannelListener for LogListener {
    fn message_received(&self, msg: &ChannelMessage) {
        info!(
            "[{}] {}",
            msg.address(),
            String::from_utf8_lossy(msg.payload())
        );
    }
}

impl MembershipListener for LogListener {
    fn member_added(&self, member: &Member) {
        info!("Member joined: {}", member);
    }

    fn member_disappeared(&self, member: &Member) {
        info!("Member left: {}", member);
    }
}

/// Logs the outcome of background sends.
struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn handle_completion(&self, message_id: &UniqueId) {
        debug!("Delivered {}", message_id);
    }

    fn handle_error(&self, error: &ChannelError, message_id: &UniqueId) {
        warn!("Failed to deliver {}: {}", message_id, error);
    }
}

async fn read_stdin(channel: Arc<GroupChannel>) {
    let options = SendOptions::ASYNCHRONOUS | SendOptions::ORDERED | SendOptions::FRAGMENTABLE;
    let handler: Arc<dyn ErrorHandler> = Arc::new(LogErrorHandler);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed");
                return;
            }
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let members = channel.members();
        if members.is_empty() {
            warn!("No verified members to send to");
            continue;
        }

        if let Err(e) = channel
            .send(&members, line.as_bytes(), options, Some(handler.clone()))
            .await
        {
            warn!("Send failed: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,group_core=debug,group_daemon=debug"
    } else {
        "info,group_core=info,group_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting group-daemon");

    let config = match &args.config {
        Some(path) => ChannelConfig::from_path(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ChannelConfig::default(),
    };

    let local = parse_member(&args.listen)?;
    let peers = args
        .peers
        .iter()
        .map(|p| parse_member(p))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    info!("Local member: {} ({})", local, local.unique_id());
    info!("Static peers: {}", peers.len());

    let (event_tx, event_rx) = mpsc::channel(1024);
    let transport = TcpTransport::with_timeouts(
        local,
        peers,
        event_tx,
        Duration::from_millis(config.failure_detector.connect_timeout_ms),
        Duration::from_millis(config.failure_detector.read_timeout_ms),
    );
    let listener = TcpTransport::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    tokio::spawn(transport.clone().serve(listener));

    let channel = Arc::new(GroupChannel::from_config(&config, transport.clone()));
    let log = Arc::new(LogListener);
    channel.add_channel_listener(log.clone());
    channel.add_membership_listener(log);
    channel.start(StartFlags::DEFAULT).await?;

    transport.announce_peers().await;
    tokio::spawn(read_stdin(channel.clone()));

    info!("Daemon running. Press Ctrl+C to stop.");
    channel
        .run(event_rx, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;

    channel.stop(StartFlags::DEFAULT).await?;
    info!("Shutting down");
    Ok(())
}
