//! Outbound dialer: one connection attempt to the fixed destination.

use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;
use tlsfwd_core::{FwdError, FwdResult};

/// Opens the outbound leg of each pairing.
///
/// No retries and no timeout beyond the OS default: a single failed dial
/// fails the whole pairing attempt.
#[derive(Debug, Clone)]
pub struct Dialer {
    host: String,
    port: u16,
}

impl Dialer {
    /// Create a dialer for `host:port`. `host` may be a name or an IP literal.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Destination in `host:port` form, for logging.
    pub fn destination(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Connect to the destination, returning the stream and the address it
    /// actually reached.
    ///
    /// # Errors
    ///
    /// Returns [`FwdError::Connect`] carrying the OS error on failure.
    pub async fn connect(&self) -> FwdResult<(TcpStream, SocketAddr)> {
        let connect_err = |source: std::io::Error| FwdError::Connect {
            addr: self.destination(),
            source,
        };
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(connect_err)?;
        // A connection reset before this point surfaces as a dial failure too.
        let peer_addr = stream.peer_addr().map_err(connect_err)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY on outbound leg");
        }
        Ok((stream, peer_addr))
    }
}
