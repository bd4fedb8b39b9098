//! Minimal TCP transport.
//!
//! Every message is one length-prefixed frame holding the bincode-encoded
//! `ChannelMessage`. Outgoing connections are opened on first use and cached
//! per destination, each behind its own lock, so a peer that is slow to
//! connect or stops reading only holds up sends to itself. Connects and
//! writes are bounded by timeouts. Inbound connections are read until closed; a frame that
//! holds the probe signature is answered with the probe ack instead of being
//! decoded.
//!
//! Membership is static: the configured peers are what the transport
//! reports. The failure detector above decides who is actually reachable.

use async_trait::async_trait;
use futures::future::join_all;
use group_core::interceptors::probe;
use group_core::wire::{read_frame, write_frame};
use group_core::{ChannelError, ChannelMessage, ChannelTransport, Member, TransportEvent};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{self, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached outgoing connection to one destination; `None` until connected.
type Connection = Arc<sync::Mutex<Option<TcpStream>>>;

pub struct TcpTransport {
    local: Member,
    peers: RwLock<Vec<Member>>,
    connections: Mutex<HashMap<Member, Connection>>,
    events: mpsc::Sender<TransportEvent>,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpTransport {
    pub fn new(
        local: Member,
        peers: Vec<Member>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<Self> {
        Self::with_timeouts(
            local,
            peers,
            events,
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_WRITE_TIMEOUT,
        )
    }

    pub fn with_timeouts(
        local: Member,
        peers: Vec<Member>,
        events: mpsc::Sender<TransportEvent>,
        connect_timeout: Duration,
        write_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            peers: RwLock::new(peers),
            connections: Mutex::new(HashMap::new()),
            events,
            connect_timeout,
            write_timeout,
        })
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Listening on {}", listen_addr);
        Ok(listener)
    }

    pub fn add_peer(&self, peer: Member) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    /// Report every configured peer upward as discovered.
    pub async fn announce_peers(&self) {
        for peer in self.members() {
            if self.events.send(TransportEvent::MemberAdded(peer)).await.is_err() {
                warn!("Event receiver dropped, not announcing peers");
                return;
            }
        }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let transport = Arc::clone(&self);
                    tokio::spawn(async move {
                        transport.read_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    return;
                }
            }
        }
    }

    async fn read_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        debug!("Connection from {}", addr);
        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Connection from {} closed", addr);
                    return;
                }
                Err(e) => {
                    debug!("Read from {} failed: {}", addr, e);
                    return;
                }
            };

            if probe::is_probe(&frame) {
                if let Err(e) = probe::respond(&mut stream).await {
                    debug!("Failed to answer probe from {}: {}", addr, e);
                }
                continue;
            }

            match ChannelMessage::decode(&frame) {
                Ok(msg) => {
                    if self.events.send(TransportEvent::Message(msg)).await.is_err() {
                        warn!("Event receiver dropped, closing connection from {}", addr);
                        return;
                    }
                }
                Err(e) => warn!("Dropping undecodable frame from {}: {}", addr, e),
            }
        }
    }

    fn connection(&self, destination: &Member) -> Connection {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(destination.clone())
            .or_default()
            .clone()
    }

    async fn write(&self, stream: &mut TcpStream, frame: &[u8]) -> io::Result<()> {
        timeout(self.write_timeout, write_frame(stream, frame))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
    }

    async fn send_to(&self, destination: &Member, frame: &[u8]) -> io::Result<()> {
        let connection = self.connection(destination);
        let mut slot = connection.lock().await;

        if let Some(stream) = slot.as_mut() {
            match self.write(stream, frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Cached connection to {} failed ({}), reconnecting", destination, e);
                    *slot = None;
                }
            }
        }

        let mut stream = timeout(self.connect_timeout, TcpStream::connect(destination.address()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        self.write(&mut stream, frame).await?;
        *slot = Some(stream);
        Ok(())
    }
}

#[async_trait]
impl ChannelTransport for TcpTransport {
    async fn send_message(
        &self,
        destinations: &[Member],
        msg: ChannelMessage,
    ) -> group_core::Result<()> {
        let frame = msg.encode()?;

        let results = join_all(destinations.iter().map(|d| self.send_to(d, &frame))).await;

        let mut first_error = None;
        for (destination, result) in destinations.iter().zip(results) {
            if let Err(e) = result {
                warn!("Send to {} failed: {}", destination, e);
                first_error.get_or_insert(ChannelError::Transport(format!(
                    "send to {} failed: {}",
                    destination, e
                )));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn members(&self) -> Vec<Member> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn local_member(&self) -> Member {
        self.local.clone()
    }
}
