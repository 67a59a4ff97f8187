//! TCP port allocation for server-mode workers.
//!
//! Bookkeeping alone is not trusted: every candidate port is probed with a
//! short connect attempt. A refused (or otherwise failed) connection means
//! nothing is listening and the port is free; a completed connection or a
//! probe that runs out of time means the port is busy.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use kiln_core::worker::PortRange;
use tokio::net::TcpStream;

/// Default bound on a single port probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from the port allocator.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// Every port in the range is reserved or in use.
    #[error("No free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

/// Finds free ports within a range.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    probe_timeout: Duration,
}

impl PortAllocator {
    pub fn new(range: PortRange, probe_timeout: Duration) -> Self {
        Self {
            range,
            probe_timeout,
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Find a free port in the allocator's range.
    pub async fn find_available_port(&self, reserved: &HashSet<u16>) -> Result<u16, PortError> {
        self.find_available_port_in(self.range, reserved).await
    }

    /// Find a free port in `range`, skipping `reserved`.
    ///
    /// If the first sweep finds nothing, a second sweep ignores the
    /// reservations in case they are stale, before giving up.
    pub async fn find_available_port_in(
        &self,
        range: PortRange,
        reserved: &HashSet<u16>,
    ) -> Result<u16, PortError> {
        for port in range.iter().filter(|p| !reserved.contains(p)) {
            if self.is_port_free(port).await {
                return Ok(port);
            }
        }

        if !reserved.is_empty() {
            tracing::warn!(
                start = range.start,
                end = range.end,
                reserved = reserved.len(),
                "No unreserved port free, retrying without reservations",
            );
            for port in range.iter() {
                if self.is_port_free(port).await {
                    return Ok(port);
                }
            }
        }

        Err(PortError::Exhausted {
            start: range.start,
            end: range.end,
        })
    }

    /// Probe `127.0.0.1:<port>` and report whether nothing answers.
    pub async fn is_port_free(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => false,
            Ok(Err(e)) => {
                tracing::trace!(port, error = %e, "Port probe refused");
                true
            }
            Err(_elapsed) => {
                tracing::debug!(port, "Port probe timed out, treating as busy");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    use super::*;

    /// Bind an ephemeral listener and return it with its port.
    async fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    /// A port that was free a moment ago.
    async fn released_port() -> u16 {
        let (listener, port) = occupied_port().await;
        drop(listener);
        port
    }

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(
            PortRange::new(start, end).expect("range"),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn listening_port_is_busy() {
        let (_listener, port) = occupied_port().await;
        assert!(!allocator(port, port).is_port_free(port).await);
    }

    #[tokio::test]
    async fn closed_port_is_free() {
        let port = released_port().await;
        assert!(allocator(port, port).is_port_free(port).await);
    }

    #[tokio::test]
    async fn skips_listening_port() {
        let (_listener, port) = occupied_port().await;
        let result = allocator(port, port)
            .find_available_port(&HashSet::new())
            .await;
        assert_matches!(result, Err(PortError::Exhausted { start, end }) if start == port && end == port);
    }

    #[tokio::test]
    async fn returns_free_port() {
        let port = released_port().await;
        let found = allocator(port, port)
            .find_available_port(&HashSet::new())
            .await
            .expect("free port");
        assert_eq!(found, port);
    }

    #[tokio::test]
    async fn never_returns_reserved_port_when_another_is_free() {
        let first = released_port().await;
        let Some(second) = first.checked_add(1) else {
            return;
        };
        // Only meaningful when the neighbour is free too.
        let a = allocator(first, second);
        if !a.is_port_free(second).await {
            return;
        }
        let reserved = HashSet::from([first]);
        let found = a.find_available_port(&reserved).await.expect("free port");
        assert_eq!(found, second);
    }

    #[tokio::test]
    async fn stale_reservation_recovered_on_second_sweep() {
        let port = released_port().await;
        let reserved = HashSet::from([port]);
        let found = allocator(port, port)
            .find_available_port(&reserved)
            .await
            .expect("second sweep should find the port");
        assert_eq!(found, port);
    }
}
