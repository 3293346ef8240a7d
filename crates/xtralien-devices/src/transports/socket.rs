/*!
 * TCP socket transport.
 *
 * Networked instruments accept a single control connection on TCP port 8888.
 * Replies are not length-prefixed, so a read collects bytes until the socket
 * has been quiet for one timeout period.
 */
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use xtralien_core::config::TransportConfig;
use xtralien_core::types::Endpoint;
use xtralien_core::utils::duration_to_millis;

use crate::error::{is_connection_kind, DeviceError, Result};
use crate::transport::Transport;

/// Size of a single socket read
const READ_CHUNK: usize = 576;

/// Default per-attempt read timeout
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(70);

/// Default connection establishment timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport to a networked instrument
#[derive(Debug)]
pub struct SocketTransport {
    /// The underlying stream, `None` after `close()`
    stream: Option<TcpStream>,
    /// Host and port, for logging and display
    endpoint: Endpoint,
    /// Per-attempt read timeout
    timeout: Duration,
}

impl SocketTransport {
    /// Connect using the default timeouts
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with_timeouts(host, port, DEFAULT_SOCKET_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
            .await
    }

    /// Connect using the timeouts from a transport configuration
    pub async fn connect_with_config(host: &str, port: u16, config: &TransportConfig) -> Result<Self> {
        Self::connect_with_timeouts(host, port, config.socket_timeout(), config.connect_timeout())
            .await
    }

    /// Connect with explicit read and connect timeouts
    pub async fn connect_with_timeouts(
        host: &str,
        port: u16,
        read_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        debug!(
            host = %host,
            port = port,
            timeout_ms = duration_to_millis(connect_timeout),
            "Connecting to instrument"
        );

        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                error!(host = %host, port = port, "TCP connection timed out");
                DeviceError::timeout(format!("connecting to {}:{}", host, port))
            })?
            .map_err(|e| {
                error!(host = %host, port = port, error = %e, "TCP connection failed");
                DeviceError::Io(e)
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(host = %host, error = %e, "Failed to set TCP_NODELAY (continuing anyway)");
        }

        info!(host = %host, port = port, "TCP connection established");

        Ok(Self::from_stream(stream, Endpoint::socket(host, port), read_timeout))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, endpoint: Endpoint, read_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            endpoint,
            timeout: read_timeout,
        }
    }

    /// The per-attempt read timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// One bounded read attempt. `Ok(None)` means the attempt timed out.
async fn read_chunk(
    stream: &mut TcpStream,
    wait: Duration,
    chunk: &mut [u8],
) -> Result<Option<usize>> {
    match timeout(wait, stream.read(chunk)).await {
        Err(_) => Ok(None),
        Ok(Ok(0)) => Err(DeviceError::connection_lost("peer closed the connection")),
        Ok(Ok(n)) => Ok(Some(n)),
        Ok(Err(e)) => Err(map_io_error(e)),
    }
}

fn map_io_error(e: std::io::Error) -> DeviceError {
    if is_connection_kind(e.kind()) {
        DeviceError::connection_lost(e.to_string())
    } else {
        DeviceError::Io(e)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(DeviceError::TransportClosed)?;

        trace!(endpoint = %self.endpoint, bytes = data.len(), "Sending data");

        stream.write_all(data).await.map_err(|e| {
            error!(endpoint = %self.endpoint, error = %e, "Failed to send data");
            map_io_error(e)
        })?;
        stream.flush().await.map_err(map_io_error)?;

        Ok(())
    }

    async fn read(&mut self, wait: bool) -> Result<String> {
        let read_timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(DeviceError::TransportClosed)?;

        let mut collected = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK];

        // No overall deadline here: an instrument may take arbitrarily long to answer.
        while wait && collected.is_empty() {
            if let Some(n) = read_chunk(stream, read_timeout, &mut chunk).await? {
                collected.extend_from_slice(&chunk[..n]);
            }
        }

        loop {
            match read_chunk(stream, read_timeout, &mut chunk).await {
                Ok(Some(n)) => collected.extend_from_slice(&chunk[..n]),
                Ok(None) => break,
                // Hand back what already arrived; the next call reports the loss.
                Err(e) if !collected.is_empty() && e.is_connection_error() => {
                    debug!(endpoint = %self.endpoint, error = %e, "Connection lost while draining");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        trace!(endpoint = %self.endpoint, bytes = collected.len(), "Received data");

        Ok(String::from_utf8(collected.to_vec())?)
    }

    async fn close(&mut self) -> Result<()> {
        let mut stream = self.stream.take().ok_or(DeviceError::TransportClosed)?;

        debug!(endpoint = %self.endpoint, "Closing TCP connection");
        if let Err(e) = stream.shutdown().await {
            warn!(
                endpoint = %self.endpoint,
                error = %e,
                "Failed to shutdown TCP stream (continuing anyway)"
            );
        }
        info!(endpoint = %self.endpoint, "TCP connection closed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn test_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_write_then_read_reply() {
        let (listener, port) = test_listener().await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"smu1 measure");
            stream.write_all(b"[1.0;2.0]\n").await.unwrap();
            // Keep the connection open until the client is done
            let _ = stream.read(&mut buf).await;
        });

        let mut transport = SocketTransport::connect("127.0.0.1", port).await.unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.endpoint(), &Endpoint::socket("127.0.0.1", port));

        transport.write_text("smu1 measure").await.unwrap();
        let reply = transport.read(true).await.unwrap();
        assert_eq!(reply, "[1.0;2.0]\n");

        transport.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_collects_split_reply() {
        let (listener, port) = test_listener().await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"[1,2;").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            stream.write_all(b"3,4]\n").await.unwrap();
            let mut buf = [0u8; 8];
            let _ = stream.read(&mut buf).await;
        });

        let mut transport = SocketTransport::connect("127.0.0.1", port).await.unwrap();
        let reply = transport.read(true).await.unwrap();
        assert_eq!(reply, "[1,2;3,4]\n");

        transport.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_without_wait_returns_empty() {
        let (listener, port) = test_listener().await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8];
            let _ = stream.read(&mut buf).await;
        });

        let mut transport = SocketTransport::connect("127.0.0.1", port).await.unwrap();
        assert_eq!(transport.read(false).await.unwrap(), "");

        transport.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_error() {
        let (listener, port) = test_listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut transport = SocketTransport::connect("127.0.0.1", port).await.unwrap();
        server.await.unwrap();

        let err = transport.read(true).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_closed_transport_fails_fast() {
        let (listener, port) = test_listener().await;
        let server = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut transport = SocketTransport::connect("127.0.0.1", port).await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());

        assert!(matches!(transport.write(b"x").await, Err(DeviceError::TransportClosed)));
        assert!(matches!(transport.read(true).await, Err(DeviceError::TransportClosed)));
        assert!(matches!(transport.close().await, Err(DeviceError::TransportClosed)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, port) = test_listener().await;
        drop(listener);

        let result = SocketTransport::connect("127.0.0.1", port).await;
        assert!(result.is_err());
    }
}
