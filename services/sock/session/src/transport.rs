//! Raw TCP transport for sockets.
//!
//! The transport is a blocking [`TcpStream`] used through shared references:
//! `&TcpStream` implements both `Read` and `Write`, so a background reader
//! can sit in `recv` while another thread sends, without any locking.

use crate::error::{Result, SockError};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use tracing::{debug, trace};

/// Connected TCP stream plus the name it was dialled with
#[derive(Debug)]
pub(crate) struct Transport {
    stream: TcpStream,
    host: String,
    peer: SocketAddr,
}

impl Transport {
    /// Connect to `host:port`, trying every resolved address in turn
    pub(crate) fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let connect_error = |source: io::Error| SockError::Connect {
            addr: addr.clone(),
            source,
        };

        let stream = TcpStream::connect((host, port)).map_err(connect_error)?;
        let peer = stream.peer_addr().map_err(connect_error)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", peer, e);
        }

        debug!("TCP connected to {} ({})", addr, peer);
        Ok(Self {
            stream,
            host: host.to_string(),
            peer,
        })
    }

    /// Host name the transport was connected with
    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    /// Remote socket address
    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Single send attempt
    pub(crate) fn send(&self, data: &[u8]) -> io::Result<usize> {
        let n = (&self.stream).write(data)?;
        trace!("Sent {} raw bytes to {}", n, self.peer);
        Ok(n)
    }

    /// Single blocking receive attempt
    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (&self.stream).read(buf)?;
        trace!("Received {} raw bytes from {}", n, self.peer);
        Ok(n)
    }

    /// Stream handle for the TLS engine's record I/O
    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Shut the connection down; already-closed sockets are not an error
    pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self.stream.shutdown(how) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}
