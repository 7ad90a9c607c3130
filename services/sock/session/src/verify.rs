//! Peer certificate verification.
//!
//! The TLS engine verifies the server chain while the handshake runs. The
//! [`RecordingVerifier`] wraps the WebPKI verifier so the outcome is kept and
//! can be queried once the handshake has structurally completed, which lets
//! the handshake engine tell a rejected certificate apart from any other
//! negotiation failure.

use crate::context::Context;
use crate::error::{Result, SockError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Result of verifying the peer certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// No certificate has been checked yet
    Pending,
    /// Chain and hostname were accepted
    Verified,
    /// Chain or hostname was rejected
    Rejected(String),
}

/// Certificate verifier that remembers its last decision
#[derive(Debug)]
pub(crate) struct RecordingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    outcome: Mutex<VerifyOutcome>,
}

impl RecordingVerifier {
    /// Build a verifier over the context's trust anchors
    pub(crate) fn new(context: &Context) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(
            Arc::clone(context.roots()),
            Arc::clone(context.provider()),
        )
        .build()
        .map_err(|e| SockError::Setup(format!("certificate verifier: {}", e)))?;

        Ok(Self {
            inner,
            outcome: Mutex::new(VerifyOutcome::Pending),
        })
    }

    /// Last recorded verification outcome
    pub(crate) fn outcome(&self) -> VerifyOutcome {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, outcome: VerifyOutcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let result = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );

        match &result {
            Ok(_) => {
                debug!("Peer certificate verified for {:?}", server_name);
                self.record(VerifyOutcome::Verified);
            }
            Err(e) => {
                warn!("Peer certificate rejected for {:?}: {}", server_name, e);
                self.record(VerifyOutcome::Rejected(e.to_string()));
            }
        }
        result
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Summary of the leaf certificate presented by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Expiry as seconds since the Unix epoch
    pub not_after: i64,
}

impl PeerCertificate {
    /// Parse a DER encoded certificate
    pub fn from_der(der: &[u8]) -> Option<Self> {
        let (_remaining, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| debug!("Failed to parse peer certificate: {:?}", e))
            .ok()?;

        Some(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }
}
