//! Shared trust context for sockets.
//!
//! A [`Context`] bundles the trusted CA certificates and the crypto provider
//! (with its seeded random generator) that every [`Connection`] built from it
//! uses. It is created once, is immutable afterwards and can be cloned freely
//! into as many connections and threads as needed.
//!
//! [`Connection`]: crate::Connection

use crate::error::{Result, SockError};
use once_cell::sync::OnceCell;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use rustls::crypto::{CryptoProvider, GetRandomFailed, SecureRandom};
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Personalization mixed into the random generator seed
pub const PERSONALIZATION: &[u8] = b"moxxmpp_socket";

/// Process-wide generator, seeded on first context creation
static PROCESS_RANDOM: OnceCell<SeededRandom> = OnceCell::new();

/// CSPRNG seeded from the OS entropy source and the process personalization.
///
/// The generator remembers the pid it was seeded for and reseeds itself when
/// it finds itself running under another one, so a forked child never
/// replays its parent's stream.
pub struct SeededRandom {
    state: Mutex<RandomState>,
}

struct RandomState {
    rng: StdRng,
    pid: u32,
}

impl RandomState {
    fn seed() -> Result<Self> {
        let pid = std::process::id();
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| SockError::EntropyInit(e.to_string()))?;

        for (i, b) in PERSONALIZATION.iter().chain(pid.to_le_bytes().iter()).enumerate() {
            seed[i % seed.len()] ^= b;
        }

        Ok(Self {
            rng: StdRng::from_seed(seed),
            pid,
        })
    }
}

impl SeededRandom {
    fn seed() -> Result<Self> {
        Ok(Self {
            state: Mutex::new(RandomState::seed()?),
        })
    }

    /// Get the process generator, seeding it if this is the first call.
    ///
    /// The TLS provider needs a `'static` source, so every context shares
    /// this one generator and draws are serialized on its lock.
    pub fn process() -> Result<&'static SeededRandom> {
        PROCESS_RANDOM.get_or_try_init(|| {
            debug!("Seeding process random generator");
            SeededRandom::seed()
        })
    }
}

impl fmt::Debug for SeededRandom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededRandom").finish_non_exhaustive()
    }
}

impl SecureRandom for SeededRandom {
    fn fill(&self, buf: &mut [u8]) -> std::result::Result<(), GetRandomFailed> {
        let mut state = self.state.lock().map_err(|_| GetRandomFailed)?;
        if state.pid != std::process::id() {
            debug!("Process id changed, reseeding random generator");
            *state = RandomState::seed().map_err(|_| GetRandomFailed)?;
        }
        state.rng.try_fill_bytes(buf).map_err(|_| GetRandomFailed)
    }
}

struct ContextInner {
    provider: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
}

/// Shared trust anchor and random generator.
///
/// Cloning is cheap and every clone refers to the same read-only state, so a
/// context may be used concurrently by any number of connections. It is
/// released once the last connection holding a clone is gone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context trusting every CA certificate found at `trust_anchor_path`.
    ///
    /// The path may be a directory (every regular file inside is scanned) or a
    /// single PEM/DER file.
    pub fn new(trust_anchor_path: impl AsRef<Path>) -> Result<Self> {
        let roots = load_trust_anchors(trust_anchor_path.as_ref())?;
        Self::with_roots(roots)
    }

    /// Create a context from an already populated root store
    pub fn with_roots(roots: RootCertStore) -> Result<Self> {
        let random = SeededRandom::process()?;
        let provider = CryptoProvider {
            secure_random: random,
            ..rustls::crypto::ring::default_provider()
        };

        info!(anchors = roots.len(), "Created socket context");
        Ok(Self {
            inner: Arc::new(ContextInner {
                provider: Arc::new(provider),
                roots: Arc::new(roots),
            }),
        })
    }

    /// Number of trusted CA certificates
    pub fn anchor_count(&self) -> usize {
        self.inner.roots.len()
    }

    pub(crate) fn provider(&self) -> &Arc<CryptoProvider> {
        &self.inner.provider
    }

    pub(crate) fn roots(&self) -> &Arc<RootCertStore> {
        &self.inner.roots
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("anchors", &self.anchor_count())
            .finish()
    }
}

/// Load every CA certificate found at `path` into a root store.
///
/// Files that cannot be parsed are skipped. Fails only when nothing usable
/// was found or the path itself cannot be read.
pub fn load_trust_anchors(path: &Path) -> Result<RootCertStore> {
    let trust_error = |reason: String| SockError::TrustStore {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(path).map_err(|e| trust_error(e.to_string()))?;
    let files: Vec<PathBuf> = if metadata.is_dir() {
        let mut files = fs::read_dir(path)
            .map_err(|e| trust_error(e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect::<Vec<_>>();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut roots = RootCertStore::empty();
    let mut skipped = 0usize;
    for file in &files {
        match read_certificates(file) {
            Ok(certs) => {
                let (_added, ignored) = roots.add_parsable_certificates(certs);
                skipped += ignored;
            }
            Err(e) => {
                debug!("Skipping {:?}: {}", file, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("Skipped {} unparsable entries under {:?}", skipped, path);
    }
    if roots.is_empty() {
        return Err(trust_error("no usable CA certificates".to_string()));
    }

    debug!(anchors = roots.len(), path = ?path, "Loaded trust anchors");
    Ok(roots)
}

fn read_certificates(file: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
    let bytes = fs::read(file)?;
    if bytes.windows(10).any(|w| w == b"-----BEGIN") {
        rustls_pemfile::certs(&mut bytes.as_slice()).collect()
    } else {
        Ok(vec![CertificateDer::from(bytes)])
    }
}
