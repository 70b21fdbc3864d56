//! Framed TCP links.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::error::{DataNodeError, Result};
use crate::frame::{Frame, DEFAULT_MAX_FRAME_BYTES, FRAME_PREFIX_SIZE};

/// TCP link configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Whether to enable TCP_NODELAY.
    pub nodelay: bool,
    /// Largest accepted encoded frame.
    pub max_frame_bytes: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            nodelay: true,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Opens and accepts framed links.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: LinkConfig,
}

impl TcpConnector {
    pub fn new(config: LinkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Connects to `addr`, failing with a link error after the connect timeout.
    pub async fn connect(&self, addr: &str) -> Result<TcpLink> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                DataNodeError::link(
                    addr,
                    format!(
                        "connect timed out after {}ms",
                        self.config.connect_timeout.as_millis()
                    ),
                )
            })?
            .map_err(|e| DataNodeError::link(addr, e.to_string()))?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = addr, "link connected");
        TcpLink::from_stream(stream, self.config.max_frame_bytes)
    }

    /// Accepts the next connection on `listener`.
    pub async fn accept(&self, listener: &TcpListener) -> Result<TcpLink> {
        let (stream, _) = listener.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        TcpLink::from_stream(stream, self.config.max_frame_bytes)
    }
}

/// One framed TCP connection. Sends and receives may run concurrently.
pub struct TcpLink {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    local_addr: String,
    max_frame_bytes: u32,
}

impl TcpLink {
    pub fn from_stream(stream: TcpStream, max_frame_bytes: u32) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
            local_addr,
            max_frame_bytes,
        })
    }

    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode(self.max_frame_bytes)?;
        let mut write = self.write.lock().await;
        write
            .write_all(&encoded)
            .await
            .map_err(|e| DataNodeError::link(&self.peer_addr, e.to_string()))?;
        write
            .flush()
            .await
            .map_err(|e| DataNodeError::link(&self.peer_addr, e.to_string()))?;
        Ok(())
    }

    /// Receives the next frame. `None` means the peer closed the connection
    /// cleanly between frames.
    pub async fn recv(&self) -> Result<Option<Frame>> {
        let mut read = self.read.lock().await;
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        match read.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(DataNodeError::link(&self.peer_addr, e.to_string())),
        }

        let len = u32::from_be_bytes(prefix);
        if len > self.max_frame_bytes {
            return Err(DataNodeError::protocol(format!(
                "frame of {} bytes from {} exceeds limit {}",
                len, self.peer_addr, self.max_frame_bytes
            )));
        }
        let mut body = vec![0u8; len as usize];
        read.read_exact(&mut body)
            .await
            .map_err(|e| DataNodeError::link(&self.peer_addr, format!("truncated frame: {}", e)))?;
        Frame::decode(&body).map(Some)
    }

    /// Like [`TcpLink::recv`], but a peer that closes or stays silent for
    /// `timeout` is a link error.
    pub async fn recv_within(&self, timeout: Duration) -> Result<Frame> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Ok(Some(frame))) => Ok(frame),
            Ok(Ok(None)) => Err(DataNodeError::link(&self.peer_addr, "connection closed")),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DataNodeError::link(
                &self.peer_addr,
                format!("no reply within {}ms", timeout.as_millis()),
            )),
        }
    }

    /// Sends `request` and waits up to `timeout` for the reply.
    pub async fn call(&self, request: &Frame, timeout: Duration) -> Result<Frame> {
        self.send(request).await?;
        self.recv_within(timeout).await
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn pair(config: LinkConfig) -> (TcpLink, TcpLink) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connector = TcpConnector::new(config);
        let accept = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.accept(&listener).await.unwrap() })
        };
        let client = connector.connect(&addr).await.unwrap();
        (client, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_send_recv_frame() {
        let (client, server) = pair(LinkConfig::default()).await;

        client
            .send(&Frame::Data {
                stream_id: 4,
                offset: 10,
                payload: Bytes::from_static(b"ping"),
            })
            .await
            .unwrap();
        let frame = server.recv().await.unwrap().unwrap();
        assert_eq!(frame.kind(), "data");

        server
            .send(&Frame::Ack {
                stream_id: 4,
                offset: 10,
                len: 4,
            })
            .await
            .unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Some(Frame::Ack {
                stream_id: 4,
                offset: 10,
                len: 4
            })
        );
        assert_eq!(client.peer_addr(), server.local_addr());
    }

    #[tokio::test]
    async fn test_recv_returns_none_on_clean_close() {
        let (client, server) = pair(LinkConfig::default()).await;
        drop(client);
        assert!(server.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_rejects_oversized_frame() {
        let (client, server) = pair(LinkConfig {
            max_frame_bytes: 32,
            ..Default::default()
        })
        .await;

        let mut write = client.write.lock().await;
        write.write_all(&1024u32.to_be_bytes()).await.unwrap();
        drop(write);

        assert!(matches!(
            server.recv().await,
            Err(DataNodeError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_recv_within_times_out() {
        let (_client, server) = pair(LinkConfig::default()).await;
        let result = server.recv_within(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(DataNodeError::Link { .. })));
    }

    #[tokio::test]
    async fn test_connect_refused_is_link_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = TcpConnector::default();
        assert!(matches!(
            connector.connect(&addr).await,
            Err(DataNodeError::Link { .. })
        ));
    }
}
