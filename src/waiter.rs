//! Polling a TCP address until something is listening on it

use crate::error::TimeoutError;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Delay between connection attempts
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capability to open a connection to an address.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<()>;
}

/// Dials over real TCP and closes the connection immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<()> {
        TcpStream::connect(addr).await.map(drop)
    }
}

/// Wait until `addr` accepts a connection or `timeout` elapses.
///
/// The first attempt is made immediately, then once per [`POLL_INTERVAL`].
/// An attempt still in progress when the deadline passes is abandoned.
pub async fn wait_reachable(
    dialer: &dyn Dialer,
    addr: &str,
    timeout: Duration,
) -> Result<(), TimeoutError> {
    info!(addr, timeout_ms = timeout.as_millis() as u64, "Waiting for connection");

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        // An expired deadline still allows one attempt.
        tokio::select! {
            biased;
            result = dialer.dial(addr) => match result {
                Ok(()) => {
                    debug!(addr, attempts, "Connection established");
                    return Ok(());
                }
                Err(e) => debug!(addr, attempts, error = %e, "Connection attempt failed"),
            },
            _ = &mut deadline => break,
        }

        tokio::select! {
            biased;
            _ = &mut deadline => break,
            _ = ticker.tick() => {}
        }
    }

    debug!(addr, attempts, "Gave up waiting for connection");
    Err(TimeoutError {
        addr: addr.to_string(),
        timeout,
    })
}
