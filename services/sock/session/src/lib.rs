//! Blocking TCP/TLS sockets with a shared trust context.
//!
//! This crate provides a thin session layer for clients that need either a
//! plain byte stream or a certificate-verified TLS stream to a remote peer,
//! with many connections sharing one set of trusted CA certificates.
//!
//! ## Features
//!
//! - **Shared Context**: trust anchors and a seeded random generator, loaded once
//! - **Plain or Secure**: connect in plain mode and optionally upgrade in place
//! - **Mandatory Verification**: certificate chain and hostname are always checked
//! - **ALPN/SNI**: single-protocol ALPN and optional server name indication
//! - **Unified I/O**: one read/write API for both modes, would-block retried internally
//! - **Background Reader**: a reader thread reporting to a registered callback
//!
//! ## Example
//!
//! ```rust,no_run
//! use sock_session::{ConnectOptions, Connection, Context, ReadEvent};
//!
//! # fn example() -> Result<(), sock_session::SockError> {
//! let context = Context::new("/etc/ssl/certs")?;
//! let conn = Connection::new(&context)?;
//!
//! let options = ConnectOptions::default()
//!     .with_alpn("xmpp-client")
//!     .with_sni("example.org");
//! conn.connect_secure("example.org", 5223, &options)?;
//! assert!(conn.is_secure());
//!
//! conn.set_read_callback(|event| match event {
//!     ReadEvent::Started => println!("reader started"),
//!     ReadEvent::Data(bytes) => println!("received {} bytes", bytes.len()),
//!     ReadEvent::Closed => println!("peer closed"),
//!     ReadEvent::Failed(e) => println!("read failed: {}", e),
//!     ReadEvent::Cancelled => println!("reader stopped"),
//! });
//! conn.start_reader(vec![0u8; 4096])?;
//!
//! conn.write(b"<stream:stream>")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod context;
pub mod error;
pub mod handshake;
mod io;
pub mod reader;
mod transport;
pub mod verify;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main types
pub use connection::{ConnectOptions, Connection};
pub use context::{load_trust_anchors, Context, SeededRandom, PERSONALIZATION};
pub use error::{Result, SockError};
pub use handshake::HandshakeState;
pub use reader::{ReadCallback, ReadEvent};
pub use verify::{PeerCertificate, VerifyOutcome};
