//! DataNode server.
//!
//! Each accepted connection either answers health checks or carries one
//! replication stream. A stream is stored locally and, when the client
//! names further replicas, relayed to the next one in the chain before it
//! is acknowledged. The stream's sessions are registered before the client
//! learns the stream id and unregistered on every exit path through the
//! registry guards.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::chunk_file::ChunkFileStore;
use crate::config::DataNodeConfig;
use crate::error::{DataNodeError, Result};
use crate::frame::Frame;
use crate::health::check_health;
use crate::link::{TcpConnector, TcpLink};
use crate::registry::{ReplicationStreamRegistry, StreamId};
use crate::session::ReplicationSession;

pub struct DataNodeServer {
    data_dir: PathBuf,
    chunks: ChunkFileStore,
    connector: TcpConnector,
    io_timeout: Duration,
    inbound: ReplicationStreamRegistry,
    outbound: ReplicationStreamRegistry,
}

impl DataNodeServer {
    pub fn new(config: &DataNodeConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            chunks: ChunkFileStore::new(&config.data_dir),
            connector: TcpConnector::new(config.link_config()),
            io_timeout: config.io_timeout(),
            inbound: ReplicationStreamRegistry::new("inbound"),
            outbound: ReplicationStreamRegistry::new("outbound"),
        }
    }

    /// Streams this node receives from clients.
    pub fn inbound(&self) -> &ReplicationStreamRegistry {
        &self.inbound
    }

    /// Streams this node relays to the next replica.
    pub fn outbound(&self) -> &ReplicationStreamRegistry {
        &self.outbound
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Accepts connections until the returned future is dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("DataNode listening on {}", listener.local_addr()?);
        loop {
            let link = match self.connector.accept(&listener).await {
                Ok(link) => link,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let peer = link.peer_addr().to_string();
                if let Err(e) = server.handle_connection(link).await {
                    debug!("connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    /// Serves one connection until the peer hangs up or a stream ends.
    pub async fn handle_connection(&self, link: TcpLink) -> Result<()> {
        loop {
            match link.recv().await? {
                None => return Ok(()),
                Some(Frame::HealthCheck) => {
                    let report = check_health(&self.data_dir).await;
                    link.send(&Frame::HealthAck {
                        status: report.status,
                        used_gib: report.used_gib,
                    })
                    .await?;
                }
                Some(Frame::Open {
                    chunk_id,
                    downstream,
                }) => {
                    return self.replicate(link, chunk_id, downstream).await.map(|_| ());
                }
                Some(other) => {
                    let err = DataNodeError::protocol(format!(
                        "unexpected {} frame outside a stream",
                        other.kind()
                    ));
                    send_error(&link, None, &err).await;
                    return Err(err);
                }
            }
        }
    }

    /// Runs one replication stream to completion and returns the number of
    /// bytes stored.
    pub async fn replicate(
        &self,
        link: TcpLink,
        chunk_id: u64,
        downstream: Vec<String>,
    ) -> Result<u64> {
        let stream_id = match self.inbound.allocate_stream_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("cannot open stream for chunk {}: {}", chunk_id, e);
                send_error(&link, None, &e).await;
                return Err(e);
            }
        };
        let span = info_span!("replicate", stream_id, chunk_id, peer = %link.peer_addr());
        async move {
            let session = Arc::new(ReplicationSession::inbound(stream_id, chunk_id, link));
            let result = self.relay(&session, &downstream).await;
            if let Err(e) = &result {
                warn!("stream failed: {}", e);
                send_error(session.link(), Some(stream_id), e).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn relay(&self, session: &Arc<ReplicationSession>, downstream: &[String]) -> Result<u64> {
        let stream_id = session.stream_id();
        let chunk_id = session.chunk_id();
        let mut chunk = self.chunks.open(chunk_id).await?;

        let next = match downstream.split_first() {
            Some((host, rest)) => Some(Arc::new(
                self.open_next_hop(stream_id, chunk_id, host, rest).await?,
            )),
            None => None,
        };

        let _outbound_guard = match &next {
            Some(out) => Some(self.outbound.register(stream_id, Arc::clone(out))?),
            None => None,
        };
        let _inbound_guard = self.inbound.register(stream_id, Arc::clone(session))?;
        session.link().send(&Frame::Opened { stream_id }).await?;
        debug!(replicas = downstream.len(), "stream opened");

        loop {
            let frame = session
                .link()
                .recv()
                .await?
                .ok_or_else(|| DataNodeError::link(session.peer(), "closed before end of stream"))?;

            match frame {
                Frame::Data {
                    stream_id: id,
                    offset,
                    payload,
                } => {
                    let target = self.inbound.lookup(id)?;
                    if !Arc::ptr_eq(&target, session) {
                        return Err(DataNodeError::protocol(format!(
                            "data for stream {} arrived on stream {}",
                            id, stream_id
                        )));
                    }

                    chunk.write_at(offset, &payload).await?;
                    if next.is_some() {
                        let out = self.outbound.lookup(id)?;
                        self.forward(&out, offset, &payload).await?;
                    }

                    let len = payload.len() as u64;
                    target.add_bytes(len);
                    target
                        .link()
                        .send(&Frame::Ack {
                            stream_id: id,
                            offset,
                            len,
                        })
                        .await?;
                }
                Frame::Close { stream_id: id } if id == stream_id => {
                    chunk.sync().await?;
                    if let Some(out) = &next {
                        self.close_next_hop(out).await?;
                    }
                    let bytes = session.bytes();
                    session.link().send(&Frame::Closed { stream_id, bytes }).await?;
                    info!(bytes, "stream complete");
                    return Ok(bytes);
                }
                other => {
                    return Err(DataNodeError::protocol(format!(
                        "unexpected {} frame on stream {}",
                        other.kind(),
                        stream_id
                    )));
                }
            }
        }
    }

    async fn open_next_hop(
        &self,
        stream_id: StreamId,
        chunk_id: u64,
        host: &str,
        rest: &[String],
    ) -> Result<ReplicationSession> {
        let link = self.connector.connect(host).await?;
        let open = Frame::Open {
            chunk_id,
            downstream: rest.to_vec(),
        };
        match link.call(&open, self.io_timeout).await? {
            Frame::Opened {
                stream_id: remote_stream_id,
            } => {
                debug!(next_hop = host, remote_stream_id, "next hop opened");
                Ok(ReplicationSession::outbound(
                    stream_id,
                    chunk_id,
                    remote_stream_id,
                    link,
                ))
            }
            Frame::Error { reason, .. } => Err(DataNodeError::link(host, reason)),
            other => Err(DataNodeError::protocol(format!(
                "{} answered open with {}",
                host,
                other.kind()
            ))),
        }
    }

    async fn forward(&self, out: &ReplicationSession, offset: u64, payload: &Bytes) -> Result<()> {
        let remote = out.wire_stream_id();
        let len = payload.len() as u64;
        let data = Frame::Data {
            stream_id: remote,
            offset,
            payload: payload.clone(),
        };

        match out.link().call(&data, self.io_timeout).await? {
            Frame::Ack {
                stream_id,
                offset: acked_offset,
                len: acked_len,
            } if stream_id == remote && acked_offset == offset && acked_len == len => {
                out.add_bytes(len);
                Ok(())
            }
            Frame::Error { reason, .. } => Err(DataNodeError::link(out.peer(), reason)),
            other => Err(DataNodeError::protocol(format!(
                "{} answered data at offset {} with {}",
                out.peer(),
                offset,
                other.kind()
            ))),
        }
    }

    async fn close_next_hop(&self, out: &ReplicationSession) -> Result<()> {
        let remote = out.wire_stream_id();
        match out
            .link()
            .call(&Frame::Close { stream_id: remote }, self.io_timeout)
            .await?
        {
            Frame::Closed { stream_id, bytes } if stream_id == remote => {
                if bytes != out.bytes() {
                    warn!(
                        "next hop {} stored {} bytes, {} forwarded",
                        out.peer(),
                        bytes,
                        out.bytes()
                    );
                }
                Ok(())
            }
            Frame::Error { reason, .. } => Err(DataNodeError::link(out.peer(), reason)),
            other => Err(DataNodeError::protocol(format!(
                "{} answered close with {}",
                out.peer(),
                other.kind()
            ))),
        }
    }
}

async fn send_error(link: &TcpLink, stream_id: Option<StreamId>, err: &DataNodeError) {
    let frame = Frame::Error {
        stream_id,
        reason: err.to_string(),
    };
    if let Err(e) = link.send(&frame).await {
        debug!("could not report error to {}: {}", link.peer_addr(), e);
    }
}
