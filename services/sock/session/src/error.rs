//! Socket error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SockError>;

/// Socket errors
#[derive(Error, Debug)]
pub enum SockError {
    /// The random generator could not be seeded from the entropy source
    #[error("entropy init failed: {0}")]
    EntropyInit(String),

    /// No trust anchor could be loaded from the given path
    #[error("trust store {path:?} unusable: {reason}")]
    TrustStore {
        /// Path that was scanned
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// The TLS configuration for a connection could not be built
    #[error("connection setup failed: {0}")]
    Setup(String),

    /// Raw transport connect failed
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// `host:port` that was dialled
        addr: String,
        /// Underlying transport error
        #[source]
        source: io::Error,
    },

    /// TLS negotiation failed before completion
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer certificate chain or hostname was rejected
    #[error("certificate verification failed: {0}")]
    Verification(String),

    /// Generic read/write failure
    #[error("i/o failure")]
    Io,

    /// Connection has no transport yet
    #[error("not connected")]
    NotConnected,

    /// Background reader started without a registered callback
    #[error("no read callback registered")]
    NoCallbackRegistered,

    /// A background reader is already running on this connection
    #[error("background reader already active")]
    ReaderActive,

    /// The reader thread could not be spawned
    #[error("reader thread spawn failed: {0}")]
    Spawn(#[source] io::Error),
}

impl SockError {
    /// Whether this error ends the usefulness of the connection it came from
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SockError::Handshake(_) | SockError::Verification(_) | SockError::Io
        )
    }
}
