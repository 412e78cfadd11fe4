//! Trait abstraction for the logger stream to enable testing

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Bidirectional byte stream to the logger
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Opens fresh transports to one fixed peer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Make one connection attempt
    async fn connect(&self) -> io::Result<Box<dyn Transport>>;

    /// Human-readable peer address, for logs and errors
    fn peer(&self) -> String;
}

/// TCP connector for the logger's access point
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<Box<dyn Transport>> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        // Commands are single bytes; don't let Nagle hold them back
        stream.set_nodelay(true)?;
        debug!("TCP connection established to {}", self.peer());
        Ok(Box::new(stream))
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
