//! TCP transport with Bonjour discovery.
//!
//! Each accepted connection owns one session; frames are LF-terminated JSON
//! objects, the same line protocol as the stdio transport. The listener is
//! advertised over mDNS under `_mcp._tcp` so local clients can find it
//! without configuration.

use mdns_sd::ServiceDaemon;
use mdns_sd::ServiceInfo;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use toolbus_protocol::JsonRpcMessage;
use toolbus_server::McpServer;
use tracing::debug;
use tracing::error;
use tracing::info;

#[derive(Error, Debug)]
pub enum TcpTransportError {
    #[error("failed to bind tcp listener: {0}")]
    Bind(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("mDNS advertisement failed: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

pub struct TcpTransportConfig {
    /// `None` picks an ephemeral port.
    pub port: Option<u16>,
    pub loopback_only: bool,
    /// Instance name in the discovery record.
    pub service_name: String,
    pub service_domain: String,
    pub advertise: bool,
}

impl TcpTransportConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        TcpTransportConfig {
            port: None,
            loopback_only: false,
            service_name: service_name.into(),
            service_domain: "local.".to_string(),
            advertise: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn loopback_only(mut self) -> Self {
        self.loopback_only = true;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.service_domain = domain.into();
        self
    }

    pub fn without_advertisement(mut self) -> Self {
        self.advertise = false;
        self
    }
}

pub struct TcpTransport {
    listener: TcpListener,
    mdns: Option<ServiceDaemon>,
}

impl TcpTransport {
    /// Bind the listener (IPv4 preferred) and, when enabled, register the
    /// discovery record. Advertisement failures are fatal at startup.
    pub async fn bind(config: TcpTransportConfig) -> Result<Self, TcpTransportError> {
        let host: IpAddr = if config.loopback_only {
            Ipv4Addr::LOCALHOST.into()
        } else {
            Ipv4Addr::UNSPECIFIED.into()
        };
        let addr = SocketAddr::new(host, config.port.unwrap_or(0));
        let listener = TcpListener::bind(addr).await.map_err(TcpTransportError::Bind)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "TCP transport listening");

        let mdns = if config.advertise {
            Some(advertise(&config, local_addr)?)
        } else {
            None
        };

        Ok(TcpTransport { listener, mdns })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self, server: Arc<McpServer>) -> Result<(), TcpTransportError> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            debug!(%peer, "client connected");
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(server, socket).await {
                    debug!(%peer, "connection ended: {err}");
                }
            });
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(mdns) = self.mdns.take() {
            let _ = mdns.shutdown();
        }
    }
}

/// Bind, advertise, and serve forever.
pub async fn serve(
    server: Arc<McpServer>,
    config: TcpTransportConfig,
) -> Result<(), TcpTransportError> {
    TcpTransport::bind(config).await?.run(server).await
}

fn advertise(
    config: &TcpTransportConfig,
    local_addr: SocketAddr,
) -> Result<ServiceDaemon, TcpTransportError> {
    let host = routable_local_ip(local_addr);
    let service_type = format!("_mcp._tcp.{}", config.service_domain);
    let host_name = format!("{host}.");
    let service = ServiceInfo::new(
        &service_type,
        &config.service_name,
        &host_name,
        host,
        local_addr.port(),
        None::<std::collections::HashMap<String, String>>,
    )?;
    let daemon = ServiceDaemon::new()?;
    daemon.register(service)?;
    info!(
        service = %config.service_name,
        %service_type,
        port = local_addr.port(),
        "advertising over mDNS"
    );
    Ok(daemon)
}

/// The address peers can actually reach. A bind to a concrete address is
/// already routable; for wildcard binds, ask the OS which interface would
/// carry outbound traffic.
fn routable_local_ip(local_addr: SocketAddr) -> IpAddr {
    if !local_addr.ip().is_unspecified() {
        return local_addr.ip();
    }
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("192.0.2.1:9")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or_else(|_| Ipv4Addr::LOCALHOST.into())
}

async fn handle_connection(server: Arc<McpServer>, socket: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    let session = server.connect(outgoing_tx);
    debug!(session = %session.id(), "tcp session up");

    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    error!("failed to serialize outgoing message: {err}");
                    continue;
                }
            };
            if write_half.write_all(json.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
                || write_half.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRpcMessage>(&line) {
            Ok(message) => session.handle_message(message).await,
            Err(err) => error!("skipping malformed frame: {err}"),
        }
    }

    session.close().await;
    drop(session);
    let _ = writer.await;
    Ok(())
}
