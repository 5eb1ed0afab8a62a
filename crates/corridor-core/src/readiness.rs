//! Readiness check for the local SOCKS inbound.
//!
//! Connects to the listener and performs a SOCKS5 no-auth greeting. The proxy
//! is considered ready once the server selects the no-auth method.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Version 5, one method offered, method 0 (no authentication).
const GREETING: [u8; 3] = [0x05, 0x01, 0x00];

/// Version 5, method 0 selected.
const ACCEPTED: [u8; 2] = [0x05, 0x00];

/// Probes a SOCKS5 listener with bounded retries.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    addr: SocketAddr,
    attempts: u32,
    interval: Duration,
    io_timeout: Duration,
}

impl ReadinessProbe {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            attempts: 20,
            interval: Duration::from_millis(250),
            io_timeout: Duration::from_secs(2),
        }
    }

    /// Sets the attempt budget and the delay between attempts.
    pub fn with_retries(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.interval = interval;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns true once a greeting succeeds, false if every attempt fails.
    pub async fn wait_ready(&self) -> bool {
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.io_timeout, greet(self.addr)).await {
                Ok(Ok(())) => {
                    tracing::info!("SOCKS inbound {} ready after {} attempt(s)", self.addr, attempt);
                    return true;
                }
                Ok(Err(e)) => {
                    tracing::debug!("Readiness attempt {} on {} failed: {}", attempt, self.addr, e)
                }
                Err(_) => tracing::debug!("Readiness attempt {} on {} timed out", attempt, self.addr),
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        tracing::warn!(
            "SOCKS inbound {} not ready after {} attempts",
            self.addr,
            self.attempts
        );
        false
    }
}

async fn greet(addr: SocketAddr) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&GREETING).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;

    if reply == ACCEPTED {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected SOCKS reply {:02x?}", reply),
        ))
    }
}
