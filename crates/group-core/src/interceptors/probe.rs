//! Direct TCP liveness probes.
//!
//! A probe opens a connection to the member's address. With the send test
//! enabled it also writes one frame holding `PROBE_SIGNATURE`; with the read
//! test it then waits for `PROBE_ACK`. Any failure or timeout along the way
//! means unreachable.

use super::failure::FailureDetectorConfig;
use crate::member::Member;
use crate::wire::write_frame;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Payload of a probe frame.
pub const PROBE_SIGNATURE: [u8; 20] = *b"GROUP-LIVENESS-PROBE";

/// Reply to a probe when the read test is enabled.
pub const PROBE_ACK: [u8; 3] = [6, 2, 3];

/// Decides whether a member answers right now.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn is_reachable(&self, member: &Member) -> bool;
}

#[derive(Debug, Clone)]
pub struct TcpProber {
    connect_timeout: Duration,
    read_timeout: Duration,
    send_test: bool,
    read_test: bool,
}

impl TcpProber {
    pub fn new(config: &FailureDetectorConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            // Reading an ack needs a probe to answer
            send_test: config.perform_send_test || config.perform_read_test,
            read_test: config.perform_read_test,
        }
    }

    async fn probe(&self, member: &Member) -> io::Result<()> {
        let address = member.address();
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        if !self.send_test {
            return Ok(());
        }

        timeout(self.read_timeout, write_frame(&mut stream, &PROBE_SIGNATURE))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "probe write timed out"))??;

        if !self.read_test {
            return Ok(());
        }

        let mut ack = [0u8; PROBE_ACK.len()];
        timeout(self.read_timeout, stream.read_exact(&mut ack))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "probe ack timed out"))??;

        if ack != PROBE_ACK {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected probe ack {:?}", ack),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn is_reachable(&self, member: &Member) -> bool {
        match self.probe(member).await {
            Ok(()) => {
                trace!("Probe of {} succeeded", member);
                true
            }
            Err(e) => {
                debug!("Probe of {} failed: {}", member, e);
                false
            }
        }
    }
}

/// Whether a received frame is a liveness probe.
pub fn is_probe(frame: &[u8]) -> bool {
    frame == PROBE_SIGNATURE
}

/// Acknowledge a probe on the connection it arrived on.
pub async fn respond<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&PROBE_ACK).await?;
    writer.flush().await
}
