//! Loopback peers and throwaway certificates for tests.

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;

/// ALPN protocol the loopback TLS peer accepts
pub(crate) const PEER_ALPN: &str = "xmpp-client";

/// A CA, a leaf issued by it for `localhost`/`127.0.0.1`, and a trust dir holding the CA
pub(crate) struct Pki {
    pub(crate) trust_dir: TempDir,
    pub(crate) ca_der: CertificateDer<'static>,
    pub(crate) leaf_der: CertificateDer<'static>,
    pub(crate) server_config: Arc<ServerConfig>,
}

impl Pki {
    pub(crate) fn generate(ca_name: &str) -> Self {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, ca_name);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let mut leaf_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        let leaf_key = KeyPair::generate().unwrap();
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .unwrap();

        let trust_dir = tempfile::tempdir().unwrap();
        std::fs::write(trust_dir.path().join("ca.pem"), ca_cert.pem()).unwrap();

        let ca_der = CertificateDer::from(ca_cert.der().to_vec());
        let leaf_der = CertificateDer::from(leaf_cert.der().to_vec());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut server_config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![leaf_der.clone()], key)
        .unwrap();
        server_config.alpn_protocols = vec![PEER_ALPN.as_bytes().to_vec()];

        Self {
            trust_dir,
            ca_der,
            leaf_der,
            server_config: Arc::new(server_config),
        }
    }
}

/// What the loopback TLS peer does once the handshake is done
#[derive(Debug, Clone)]
pub(crate) enum TlsPeer {
    /// Echo every byte until the client goes away
    Echo,
    /// Send the greeting, then a close-notify
    Greet(Vec<u8>),
    /// Drop the TCP connection without a close-notify
    Drop,
}

/// Start a single-connection TLS peer on an ephemeral loopback port
pub(crate) fn spawn_tls_peer(config: Arc<ServerConfig>, behavior: TlsPeer) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let Ok((mut sock, _)) = listener.accept() else {
            return;
        };
        let Ok(mut conn) = ServerConnection::new(config) else {
            return;
        };
        while conn.is_handshaking() {
            if conn.complete_io(&mut sock).is_err() {
                return;
            }
        }

        match behavior {
            TlsPeer::Echo => {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    let mut tls = rustls::Stream::new(&mut conn, &mut sock);
                    match tls.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            TlsPeer::Greet(greeting) => {
                let mut tls = rustls::Stream::new(&mut conn, &mut sock);
                let _ = tls.write_all(&greeting);
                conn.send_close_notify();
                let _ = conn.complete_io(&mut sock);
                thread::sleep(Duration::from_millis(100));
            }
            TlsPeer::Drop => {
                while conn.wants_write() {
                    if conn.write_tls(&mut sock).is_err() {
                        break;
                    }
                }
                drop(sock);
            }
        }
    });

    (port, handle)
}

/// Start a plain TCP peer that echoes until the client hangs up
pub(crate) fn spawn_plain_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let Ok((mut sock, _)) = listener.accept() else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            match sock.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sock.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    port
}

/// Start a plain TCP peer that answers a client hello with non-TLS bytes
pub(crate) fn spawn_garbage_peer() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let Ok((mut sock, _)) = listener.accept() else {
            return;
        };
        let mut hello = [0u8; 512];
        let _ = sock.read(&mut hello);
        let _ = sock.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
        thread::sleep(Duration::from_millis(100));
    });
    port
}

/// Port with nothing listening on it
pub(crate) fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Keep a listener open without ever accepting TLS, for tests that only need a socket
pub(crate) fn spawn_silent_peer() -> (u16, JoinHandle<Option<TcpStream>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || listener.accept().ok().map(|(sock, _)| sock));
    (port, handle)
}
