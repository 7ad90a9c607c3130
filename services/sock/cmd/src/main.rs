//! Line-oriented TCP/TLS client.
//!
//! Connects to a peer in plain or secure mode, forwards stdin line by line and
//! prints whatever the background reader receives until the peer closes, a
//! read fails, stdin ends or the process is interrupted.

use anyhow::{bail, Context as _};
use clap::Parser;
use sock_session::{ConnectOptions, Connection, Context, ReadEvent, SockError};
use std::{path::PathBuf, sync::Arc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::SockConfig;
use logging::SockLogFormatter;

/// Plain or TLS line client
#[derive(Parser, Debug)]
#[command(name = "redb-sock", version, about = "Line-oriented TCP/TLS client")]
struct Args {
    /// Host to connect to
    #[arg(long)]
    host: Option<String>,

    /// Port to connect to
    #[arg(long)]
    port: Option<u16>,

    /// Run the TLS handshake after connecting
    #[arg(long, conflicts_with = "plain")]
    secure: bool,

    /// Stay in plain mode
    #[arg(long)]
    plain: bool,

    /// ALPN protocol to advertise, e.g. xmpp-client
    #[arg(long)]
    alpn: Option<String>,

    /// Server name for TLS SNI
    #[arg(long)]
    sni: Option<String>,

    /// Directory or file of trusted CA certificates
    #[arg(long)]
    ca_path: Option<PathBuf>,

    /// Background reader buffer size in bytes
    #[arg(long)]
    read_buffer: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "sock.yaml")]
    config: PathBuf,
}

impl Args {
    /// Command line flags take precedence over file and environment
    fn apply(&self, config: &mut SockConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.secure {
            config.secure = true;
        }
        if self.plain {
            config.secure = false;
        }
        if self.alpn.is_some() {
            config.alpn = self.alpn.clone();
        }
        if self.sni.is_some() {
            config.sni = self.sni.clone();
        }
        if let Some(ca_path) = &self.ca_path {
            config.ca_path = ca_path.display().to_string();
        }
        if let Some(read_buffer) = self.read_buffer {
            config.read_buffer = read_buffer;
        }
    }
}

/// Owned copy of a [`ReadEvent`] handed from the reader thread to the main task
#[derive(Debug)]
enum Incoming {
    Data(Vec<u8>),
    Closed,
    Failed(String),
    Cancelled,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("redb_sock={}", args.log_level).parse()?)
        .add_directive(format!("sock_session={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(SockLogFormatter::new("sock"))
        .init();

    info!("Starting reDB Sock v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SockConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    if config.read_buffer == 0 {
        bail!("read buffer size must be positive");
    }

    let conn = Arc::new(connect(config.clone()).await?);
    if let Some(peer) = conn.peer_addr() {
        component_info!("cli", "Connected to {} (secure: {})", peer, conn.is_secure());
    }
    if let Some(protocol) = conn.alpn_protocol() {
        component_info!("cli", "Negotiated ALPN protocol {}", protocol);
    }
    if let Some(cert) = conn.peer_certificate() {
        component_info!(
            "cli",
            "Peer certificate subject={} issuer={}",
            cert.subject,
            cert.issuer
        );
    }

    let (tx, mut incoming) = mpsc::unbounded_channel();
    conn.set_read_callback(move |event| {
        let owned = match event {
            ReadEvent::Started => {
                debug!("Reader loop started");
                return;
            }
            ReadEvent::Data(bytes) => Incoming::Data(bytes.to_vec()),
            ReadEvent::Closed => Incoming::Closed,
            ReadEvent::Failed(e) => Incoming::Failed(e.to_string()),
            ReadEvent::Cancelled => Incoming::Cancelled,
        };
        let _ = tx.send(owned);
    });
    conn.start_reader(vec![0u8; config.read_buffer])
        .context("failed to start background reader")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) => {
                        let data = format!("{}\n", line).into_bytes();
                        let writer = Arc::clone(&conn);
                        let sent = tokio::task::spawn_blocking(move || write_all(&writer, &data))
                            .await
                            .context("writer task failed")?;
                        if let Err(e) = sent {
                            component_warn!("cli", "Write failed: {}", e);
                            if e.is_terminal() {
                                break;
                            }
                        }
                    }
                    None => {
                        debug!("Stdin closed, waiting for peer");
                        stdin_open = false;
                    }
                }
            }
            event = incoming.recv() => match event {
                Some(Incoming::Data(bytes)) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                Some(Incoming::Closed) => {
                    info!("Peer closed the connection");
                    break;
                }
                Some(Incoming::Failed(reason)) => {
                    component_error!("cli", "Read failed: {}", reason);
                    break;
                }
                Some(Incoming::Cancelled) | None => break,
            }
        }
    }

    let closing = Arc::clone(&conn);
    match tokio::task::spawn_blocking(move || closing.shutdown()).await? {
        Ok(()) => info!("Connection closed"),
        Err(e) => warn!("Shutdown failed: {}", e),
    }
    Ok(())
}

/// Build the trust context and connect, off the async runtime
async fn connect(config: SockConfig) -> anyhow::Result<Connection> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<Connection> {
        let context = Context::new(&config.ca_path)
            .with_context(|| format!("failed to load trust anchors from {}", config.ca_path))?;
        component_info!("cli", "Loaded {} trust anchors", context.anchor_count());

        let conn = Connection::new(&context)?;
        let target = format!("{}:{}", config.host, config.port);
        if config.secure {
            let options = ConnectOptions {
                alpn: config.alpn.clone(),
                sni: config.sni.clone(),
            };
            conn.connect_secure(&config.host, config.port, &options)
                .with_context(|| format!("secure connect to {} failed", target))?;
        } else {
            conn.connect_plain(&config.host, config.port)
                .with_context(|| format!("connect to {} failed", target))?;
        }
        Ok(conn)
    })
    .await?
}

/// Keep writing until all of `data` is sent; a single write may be partial
fn write_all(conn: &Connection, mut data: &[u8]) -> Result<(), SockError> {
    while !data.is_empty() {
        let n = conn.write(data)?;
        data = &data[n..];
    }
    Ok(())
}
