//! Configuration handling for the sock client.
//!
//! Configuration is read from an optional YAML file, then overridden by
//! environment variables, then by command line flags (applied in `main`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Sock client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SockConfig {
    /// Host to connect to
    pub host: String,
    /// Port to connect to
    pub port: u16,
    /// Whether to run the TLS handshake after connecting
    pub secure: bool,
    /// ALPN protocol to advertise
    pub alpn: Option<String>,
    /// SNI hostname
    pub sni: Option<String>,
    /// Directory (or file) holding trusted CA certificates
    pub ca_path: String,
    /// Size of the background reader buffer
    pub read_buffer: usize,
}

impl Default for SockConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5222,
            secure: true,
            alpn: None,
            sni: None,
            ca_path: "/etc/ssl/certs".to_string(),
            read_buffer: 4096,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    sock: Option<SockSection>,
}

#[derive(Debug, Default, Deserialize)]
struct SockSection {
    host: Option<String>,
    port: Option<u16>,
    secure: Option<bool>,
    alpn: Option<String>,
    sni: Option<String>,
    ca_path: Option<String>,
    read_buffer: Option<usize>,
}

impl SockConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(section) = root.sock {
                        config.apply_section(section);
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        } else {
            warn!("Config file {:?} not found, using defaults", config_path.as_ref());
        }

        config.apply_environment_overrides(|key| std::env::var(key).ok());

        info!(
            "Final sock configuration: host={}, port={}, secure={}, ca_path={}",
            config.host, config.port, config.secure, config.ca_path
        );
        Ok(config)
    }

    fn apply_section(&mut self, section: SockSection) {
        if let Some(host) = section.host {
            self.host = host;
        }
        if let Some(port) = section.port {
            self.port = port;
        }
        if let Some(secure) = section.secure {
            self.secure = secure;
        }
        if section.alpn.is_some() {
            self.alpn = section.alpn;
        }
        if section.sni.is_some() {
            self.sni = section.sni;
        }
        if let Some(ca_path) = section.ca_path {
            self.ca_path = ca_path;
        }
        if let Some(read_buffer) = section.read_buffer {
            self.read_buffer = read_buffer;
        }
    }

    /// Apply environment variable overrides, looked up through `var`
    fn apply_environment_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("SOCK_HOST") {
            self.host = host;
            info!("Host overridden by environment: {}", self.host);
        }

        if let Some(port) = var("SOCK_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid SOCK_PORT value {:?}", port),
            }
        }

        if let Some(secure) = var("SOCK_SECURE") {
            self.secure = matches!(secure.to_lowercase().as_str(), "true" | "1" | "yes");
            info!("Secure mode overridden by environment: {}", self.secure);
        }

        if let Some(alpn) = var("SOCK_ALPN") {
            self.alpn = Some(alpn);
        }

        if let Some(sni) = var("SOCK_SNI") {
            self.sni = Some(sni);
        }

        if let Some(ca_path) = var("SOCK_CA_PATH") {
            self.ca_path = ca_path;
            info!("CA path overridden by environment: {}", self.ca_path);
        }
    }
}
