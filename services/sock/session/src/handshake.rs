//! TLS handshake engine.
//!
//! Drives a connection from `Unstarted` through `InProgress` to either
//! `Established` or `Failed`. Would-block outcomes are retried in place;
//! every other failure is terminal. After the exchange completes the
//! certificate verification result is queried explicitly, so a rejected
//! certificate surfaces as [`SockError::Verification`] rather than as a
//! generic [`SockError::Handshake`].

use crate::connection::{lock, ConnectOptions, Shared};
use crate::error::{Result, SockError};
use crate::io::{is_would_block, TlsSession};
use crate::transport::Transport;
use crate::verify::VerifyOutcome;
use rustls::pki_types::ServerName;
use rustls::ClientConnection;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handshake progress of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No handshake attempted yet
    Unstarted,
    /// Handshake is running
    InProgress,
    /// Handshake and verification succeeded
    Established,
    /// Handshake or verification failed; the connection is unusable
    Failed,
}

/// Failure of a single handshake step
enum StepError {
    Io(io::Error),
    Tls(rustls::Error),
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Io(e) => write!(f, "transport: {}", e),
            StepError::Tls(e) => write!(f, "tls: {}", e),
        }
    }
}

impl From<io::Error> for StepError {
    fn from(e: io::Error) -> Self {
        StepError::Io(e)
    }
}

impl From<rustls::Error> for StepError {
    fn from(e: rustls::Error) -> Self {
        StepError::Tls(e)
    }
}

/// Run the handshake on an already connected transport
pub(crate) fn perform(shared: &Shared, options: &ConnectOptions) -> Result<()> {
    let transport = shared.transport()?;

    {
        let mut state = lock(&shared.state);
        match *state {
            HandshakeState::Unstarted => *state = HandshakeState::InProgress,
            HandshakeState::InProgress => {
                return Err(SockError::Handshake("handshake already in progress".into()))
            }
            HandshakeState::Established => {
                return Err(SockError::Handshake("session already established".into()))
            }
            HandshakeState::Failed => {
                return Err(SockError::Handshake("previous handshake failed".into()))
            }
        }
    }

    debug!(
        host = %transport.host(),
        alpn = ?options.alpn,
        sni = ?options.sni,
        "Starting TLS handshake"
    );

    match establish(shared, transport, options) {
        Ok(session) => {
            info!(
                host = %transport.host(),
                alpn = ?session.alpn_protocol(),
                "TLS session established"
            );
            *lock(&shared.tls) = Some(session);
            shared.secure.store(true, Ordering::Release);
            *lock(&shared.state) = HandshakeState::Established;
            Ok(())
        }
        Err(e) => {
            warn!(host = %transport.host(), "TLS handshake failed: {}", e);
            *lock(&shared.state) = HandshakeState::Failed;
            if let Err(close_err) = transport.shutdown(Shutdown::Both) {
                debug!("Failed to close transport after handshake failure: {}", close_err);
            }
            Err(e)
        }
    }
}

fn establish(shared: &Shared, transport: &Transport, options: &ConnectOptions) -> Result<TlsSession> {
    let mut config = shared.config.clone();
    if let Some(alpn) = &options.alpn {
        config.alpn_protocols = vec![alpn.as_bytes().to_vec()];
    }
    config.enable_sni = options.sni.is_some();

    let name = options.sni.as_deref().unwrap_or_else(|| transport.host());
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| SockError::Handshake(format!("invalid server name {:?}: {}", name, e)))?;

    let mut conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| SockError::Handshake(e.to_string()))?;

    while conn.is_handshaking() {
        match step(&mut conn, transport) {
            Ok(()) => {}
            Err(StepError::Io(e)) if is_would_block(&e) => continue,
            Err(e) => {
                // Best effort: deliver any alert the engine queued
                let _ = conn.write_tls(&mut transport.stream());
                return Err(classify(shared.verifier.outcome(), e));
            }
        }
    }

    while conn.wants_write() {
        match conn.write_tls(&mut transport.stream()) {
            Ok(_) => {}
            Err(e) if is_would_block(&e) => continue,
            Err(e) => return Err(classify(shared.verifier.outcome(), e.into())),
        }
    }

    match shared.verifier.outcome() {
        VerifyOutcome::Verified => Ok(TlsSession::new(conn)),
        VerifyOutcome::Rejected(reason) => Err(SockError::Verification(reason)),
        VerifyOutcome::Pending => Err(SockError::Verification(
            "peer certificate was never verified".into(),
        )),
    }
}

/// One handshake step: flush pending records, or read and process the next ones
fn step(conn: &mut ClientConnection, transport: &Transport) -> std::result::Result<(), StepError> {
    if conn.wants_write() {
        conn.write_tls(&mut transport.stream())?;
        return Ok(());
    }

    if conn.wants_read() {
        if conn.read_tls(&mut transport.stream())? == 0 {
            return Err(StepError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection during handshake",
            )));
        }
        conn.process_new_packets()?;
    }
    Ok(())
}

fn classify(outcome: VerifyOutcome, error: StepError) -> SockError {
    match (outcome, error) {
        (VerifyOutcome::Rejected(reason), _) => SockError::Verification(reason),
        (_, StepError::Tls(e @ rustls::Error::InvalidCertificate(_))) => {
            SockError::Verification(e.to_string())
        }
        (_, e) => SockError::Handshake(e.to_string()),
    }
}
