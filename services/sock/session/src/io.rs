//! Read/write dispatch.
//!
//! Both operations branch on the connection's secure flag. Plain I/O is a
//! single transport call. Secure I/O goes through the TLS session and quietly
//! retries whenever the engine reports it would block: writes flush queued
//! records and try again, reads pull more ciphertext off the wire.
//!
//! Ciphertext is received without holding the session lock so a concurrent
//! writer is never stuck behind a reader blocked in `recv`. Readers are
//! serialized by the connection's read side instead, which the caller holds
//! for the whole receive-then-decrypt cycle and which also owns the
//! receive buffer.

use crate::connection::{lock, Shared};
use crate::error::{Result, SockError};
use crate::handshake::HandshakeState;
use crate::transport::Transport;
use rustls::ClientConnection;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Size of one receive from the wire in secure mode
pub(crate) const RECV_CHUNK: usize = 16 * 1024;

/// An established TLS session plus ciphertext received but not yet fed to it
pub(crate) struct TlsSession {
    conn: ClientConnection,
    pending: Vec<u8>,
    peer_eof: bool,
    eof_fed: bool,
}

impl TlsSession {
    pub(crate) fn new(conn: ClientConnection) -> Self {
        Self {
            conn,
            pending: Vec::new(),
            peer_eof: false,
            eof_fed: false,
        }
    }

    pub(crate) fn alpn_protocol(&self) -> Option<String> {
        self.conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    pub(crate) fn peer_certificate_der(&self) -> Option<Vec<u8>> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
    }

    /// Queue a close-notify alert and flush it
    pub(crate) fn close_notify(&mut self, transport: &Transport) -> Result<()> {
        self.conn.send_close_notify();
        self.flush(transport)
    }

    /// Write every queued TLS record to the transport
    fn flush(&mut self, transport: &Transport) -> Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut transport.stream()) {
                Ok(_) => {}
                Err(e) if is_would_block(&e) => continue,
                Err(e) => return Err(io_failure("tls flush", e)),
            }
        }
        Ok(())
    }

    /// Feed buffered ciphertext (or the peer's EOF) to the engine.
    ///
    /// Returns false when there was nothing to feed.
    fn feed(&mut self, transport: &Transport) -> Result<bool> {
        if !self.pending.is_empty() {
            let mut records = self.pending.as_slice();
            let consumed = self
                .conn
                .read_tls(&mut records)
                .map_err(|e| io_failure("tls read", e))?;
            self.pending.drain(..consumed);
        } else if self.peer_eof && !self.eof_fed {
            self.eof_fed = true;
            self.conn
                .read_tls(&mut io::empty())
                .map_err(|e| io_failure("tls eof", e))?;
        } else {
            return Ok(false);
        }

        self.conn
            .process_new_packets()
            .map_err(|e| io_failure("tls records", e))?;
        // Key updates and alerts may need answering
        self.flush(transport)?;
        Ok(true)
    }
}

/// Whether an I/O error only means "not ready yet"
pub(crate) fn is_would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Log the cause of an I/O failure and collapse it into [`SockError::Io`]
pub(crate) fn io_failure(what: &str, cause: impl fmt::Display) -> SockError {
    debug!("{} failed: {}", what, cause);
    SockError::Io
}

fn ensure_usable(shared: &Shared) -> Result<&Transport> {
    let transport = shared.transport()?;
    if *lock(&shared.state) == HandshakeState::Failed {
        return Err(io_failure("i/o", "connection failed its handshake"));
    }
    Ok(transport)
}

/// Write `data` through the TLS session or straight to the transport
pub(crate) fn write(shared: &Shared, data: &[u8]) -> Result<usize> {
    let transport = ensure_usable(shared)?;

    if !shared.secure.load(Ordering::Acquire) {
        return match transport.send(data) {
            Ok(n) if n > 0 => Ok(n),
            Ok(_) => Err(io_failure("send", "no bytes written")),
            Err(e) => Err(io_failure("send", e)),
        };
    }

    let mut guard = lock(&shared.tls);
    let session = guard
        .as_mut()
        .ok_or_else(|| io_failure("tls write", "no session"))?;

    loop {
        match session.conn.writer().write(data) {
            Ok(n) if n > 0 => {
                session.flush(transport)?;
                trace!("Wrote {} plaintext bytes", n);
                return Ok(n);
            }
            // Outgoing buffer full: drain it and retry the same write
            Ok(_) if !data.is_empty() && session.conn.wants_write() => session.flush(transport)?,
            Ok(_) => return Err(io_failure("tls write", "no bytes accepted")),
            Err(e) if is_would_block(&e) => session.flush(transport)?,
            Err(e) => return Err(io_failure("tls write", e)),
        }
    }
}

/// Read into `buf` from the TLS session or straight from the transport.
///
/// `buf` is zero-filled first. `Ok(0)` is an orderly end of stream.
/// `chunk` is the receive buffer from the held read side.
pub(crate) fn read(shared: &Shared, chunk: &mut Vec<u8>, buf: &mut [u8]) -> Result<usize> {
    buf.fill(0);
    let transport = ensure_usable(shared)?;

    if !shared.secure.load(Ordering::Acquire) {
        return transport.recv(buf).map_err(|e| io_failure("recv", e));
    }

    if chunk.len() != RECV_CHUNK {
        chunk.resize(RECV_CHUNK, 0);
    }
    loop {
        {
            let mut guard = lock(&shared.tls);
            let session = guard
                .as_mut()
                .ok_or_else(|| io_failure("tls read", "no session"))?;

            match session.conn.reader().read(buf) {
                // Zero here means the peer sent close-notify
                Ok(n) => {
                    trace!("Read {} plaintext bytes", n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(io_failure("tls read", e)),
            }

            if session.feed(transport)? {
                continue;
            }
            if session.eof_fed {
                return Err(io_failure("tls read", "peer closed without close-notify"));
            }
        }

        let n = loop {
            match transport.recv(chunk) {
                Ok(n) => break n,
                Err(e) if is_would_block(&e) => continue,
                Err(e) => return Err(io_failure("recv", e)),
            }
        };

        let mut guard = lock(&shared.tls);
        let session = guard
            .as_mut()
            .ok_or_else(|| io_failure("tls read", "no session"))?;
        if n == 0 {
            session.peer_eof = true;
        } else {
            session.pending.extend_from_slice(&chunk[..n]);
        }
    }
}
