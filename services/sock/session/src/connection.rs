//! Per-peer connection state and lifecycle.
//!
//! A [`Connection`] starts unconnected. It is connected either in plain mode
//! or in secure mode (plain connect followed by the TLS handshake), after
//! which bytes move through [`Connection::write`] and [`Connection::read`] or
//! through a background reader feeding a registered callback.

use crate::context::Context;
use crate::error::{Result, SockError};
use crate::handshake::{self, HandshakeState};
use crate::io::{self as sock_io, TlsSession};
use crate::reader::{ReadCallback, ReadEvent, ReaderSlot};
use crate::transport::Transport;
use crate::verify::{PeerCertificate, RecordingVerifier, VerifyOutcome};
use once_cell::sync::OnceCell;
use rustls::client::danger::ServerCertVerifier;
use rustls::ClientConfig;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Options for the TLS handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Single ALPN protocol to advertise
    pub alpn: Option<String>,
    /// Server name sent in the client hello and checked against the certificate
    pub sni: Option<String>,
}

impl ConnectOptions {
    /// Advertise `protocol` via ALPN
    pub fn with_alpn(mut self, protocol: impl Into<String>) -> Self {
        self.alpn = Some(protocol.into());
        self
    }

    /// Send `name` as SNI
    pub fn with_sni(mut self, name: impl Into<String>) -> Self {
        self.sni = Some(name.into());
        self
    }
}

/// State shared between a connection and its background reader thread
pub(crate) struct Shared {
    pub(crate) context: Context,
    pub(crate) config: ClientConfig,
    pub(crate) verifier: Arc<RecordingVerifier>,
    pub(crate) transport: OnceCell<Transport>,
    pub(crate) tls: Mutex<Option<TlsSession>>,
    /// Held for a whole read; also owns the ciphertext receive buffer
    pub(crate) read_side: Mutex<Vec<u8>>,
    pub(crate) state: Mutex<HandshakeState>,
    pub(crate) secure: AtomicBool,
    pub(crate) callback: Mutex<Option<ReadCallback>>,
    pub(crate) reading: AtomicBool,
    pub(crate) cancel: AtomicBool,
}

impl Shared {
    pub(crate) fn transport(&self) -> Result<&Transport> {
        self.transport.get().ok_or(SockError::NotConnected)
    }
}

/// Lock a mutex, recovering the data if another thread panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A plain or TLS client connection to one peer
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
    pub(crate) reader: ReaderSlot,
}

impl Connection {
    /// Create an unconnected socket bound to `context`'s trust anchors.
    ///
    /// Certificate verification is always required; there is no way to turn
    /// it off.
    pub fn new(context: &Context) -> Result<Self> {
        let verifier = Arc::new(RecordingVerifier::new(context)?);
        let config = ClientConfig::builder_with_provider(Arc::clone(context.provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| SockError::Setup(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::clone(&verifier) as Arc<dyn ServerCertVerifier>)
            .with_no_client_auth();

        Ok(Self {
            shared: Arc::new(Shared {
                context: context.clone(),
                config,
                verifier,
                transport: OnceCell::new(),
                tls: Mutex::new(None),
                read_side: Mutex::new(Vec::new()),
                state: Mutex::new(HandshakeState::Unstarted),
                secure: AtomicBool::new(false),
                callback: Mutex::new(None),
                reading: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
            }),
            reader: ReaderSlot::default(),
        })
    }

    /// Open the raw transport to `host:port`; the connection stays unencrypted
    pub fn connect_plain(&self, host: &str, port: u16) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        let already_connected = || SockError::Connect {
            addr: addr.clone(),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "already connected"),
        };

        if self.shared.transport.get().is_some() {
            return Err(already_connected());
        }
        let transport = Transport::connect(host, port)?;
        self.shared
            .transport
            .set(transport)
            .map_err(|_| already_connected())?;

        info!(host = %host, port, "Connected");
        Ok(())
    }

    /// Open the raw transport and immediately run the TLS handshake.
    ///
    /// On failure the connection is unusable and should be dropped.
    pub fn connect_secure(&self, host: &str, port: u16, options: &ConnectOptions) -> Result<()> {
        self.connect_plain(host, port)?;
        self.handshake(options)
    }

    /// Upgrade an already connected socket to TLS in place
    pub fn handshake(&self, options: &ConnectOptions) -> Result<()> {
        if self.shared.reading.load(Ordering::Acquire) {
            return Err(SockError::ReaderActive);
        }
        handshake::perform(&self.shared, options)
    }

    /// Write `data`, returning how many bytes were accepted.
    ///
    /// No partial-write loop runs here; call again with the remainder.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        sock_io::write(&self.shared, data)
    }

    /// Read into `buf`, returning the byte count; `0` means orderly end of stream.
    ///
    /// `buf` is zero-filled first. Concurrent calls are served one at a time.
    /// Fails with [`SockError::ReaderActive`] while a background reader owns
    /// the read side.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.shared.reading.load(Ordering::Acquire) {
            return Err(SockError::ReaderActive);
        }
        let mut side = lock(&self.shared.read_side);
        // A reader may have started while we waited for the read side
        if self.shared.reading.load(Ordering::Acquire) {
            return Err(SockError::ReaderActive);
        }
        sock_io::read(&self.shared, &mut side, buf)
    }

    /// Whether the TLS handshake completed; never reverts once true
    pub fn is_secure(&self) -> bool {
        self.shared.secure.load(Ordering::Acquire)
    }

    /// Current handshake state
    pub fn handshake_state(&self) -> HandshakeState {
        *lock(&self.shared.state)
    }

    /// Outcome of the peer certificate check
    pub fn verification(&self) -> VerifyOutcome {
        self.shared.verifier.outcome()
    }

    /// Register the callback the background reader reports to
    pub fn set_read_callback<F>(&self, callback: F)
    where
        F: Fn(ReadEvent<'_>) + Send + Sync + 'static,
    {
        let callback: ReadCallback = Arc::new(callback);
        *lock(&self.shared.callback) = Some(callback);
    }

    /// Remove the registered callback; a running reader keeps the one it started with
    pub fn clear_read_callback(&self) {
        lock(&self.shared.callback).take();
    }

    /// Start the background reader, which reads into `buf` until end of stream.
    ///
    /// The callback first receives [`ReadEvent::Started`] on the calling
    /// thread; every later event comes from the reader thread. If the thread
    /// cannot be spawned, the callback receives [`ReadEvent::Failed`] before
    /// [`SockError::Spawn`] is returned. Fails with [`SockError::ReaderActive`]
    /// while another reader, or a manual [`read`](Self::read), holds the read side.
    pub fn start_reader(&self, buf: Vec<u8>) -> Result<()> {
        self.reader.start(&self.shared, buf)
    }

    /// Stop the background reader and return its buffer.
    ///
    /// A reader still blocked in a read is unblocked by shutting the transport
    /// down, so the connection cannot be used for I/O afterwards.
    pub fn stop_reader(&self) -> Option<Vec<u8>> {
        self.reader.stop(&self.shared)
    }

    /// Whether a background reader is running
    pub fn is_reading(&self) -> bool {
        self.shared.reading.load(Ordering::Acquire)
    }

    /// Protocol agreed via ALPN, if any
    pub fn alpn_protocol(&self) -> Option<String> {
        lock(&self.shared.tls)
            .as_ref()
            .and_then(|session| session.alpn_protocol())
    }

    /// Summary of the certificate the peer presented
    pub fn peer_certificate(&self) -> Option<PeerCertificate> {
        lock(&self.shared.tls)
            .as_ref()
            .and_then(|session| session.peer_certificate_der())
            .and_then(|der| PeerCertificate::from_der(&der))
    }

    /// Remote address, once connected
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.get().map(Transport::peer_addr)
    }

    /// Context this connection was created from
    pub fn context(&self) -> &Context {
        &self.shared.context
    }

    /// Close the connection in an orderly way.
    ///
    /// Sends a close-notify when secure, stops any background reader and
    /// shuts the transport down in both directions.
    pub fn shutdown(&self) -> Result<()> {
        let transport = self.shared.transport()?;
        if self.is_secure() {
            if let Some(session) = lock(&self.shared.tls).as_mut() {
                session.close_notify(transport)?;
            }
        }
        self.stop_reader();
        transport
            .shutdown(Shutdown::Both)
            .map_err(|e| sock_io::io_failure("shutdown", e))?;

        debug!("Connection to {} shut down", transport.peer_addr());
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_addr())
            .field("secure", &self.is_secure())
            .field("state", &self.handshake_state())
            .field("reading", &self.is_reading())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.stop_reader().is_some() {
            debug!("Stopped background reader during teardown");
        }
    }
}
