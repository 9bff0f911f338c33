//! Endpoints that produce the duplex byte stream to the datastore process.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use kvbridge_settings::IpcSettings;

/// Any duplex byte stream the transport can drive.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed stream handed from a [`Connector`] to the transport.
pub type BoxedStream = Box<dyn IoStream>;

/// Opens a fresh stream on every call. Used for the initial connect and for
/// each reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new stream.
    async fn connect(&self) -> std::io::Result<BoxedStream>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Unix domain socket endpoint.
#[cfg(unix)]
#[derive(Clone, Debug)]
pub struct UnixConnector {
    path: PathBuf,
}

#[cfg(unix)]
impl UnixConnector {
    /// Connect to the socket at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> std::io::Result<BoxedStream> {
        let stream = tokio::net::UnixStream::connect(&self.path).await?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

/// TCP endpoint.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Connect to `host:port`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> std::io::Result<BoxedStream> {
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        format!("tcp:{}", self.addr)
    }
}

/// Pick the connector described by the settings: TCP when an address is
/// configured, otherwise the Unix socket.
pub fn connector_from_settings(settings: &IpcSettings) -> Arc<dyn Connector> {
    if let Some(addr) = &settings.tcp_addr {
        return Arc::new(TcpConnector::new(addr.clone()));
    }
    #[cfg(unix)]
    {
        Arc::new(UnixConnector::new(settings.socket_path.clone()))
    }
    #[cfg(not(unix))]
    {
        Arc::new(TcpConnector::new("127.0.0.1:7878"))
    }
}
