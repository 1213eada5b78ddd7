//! Line-framed transports.
//!
//! Both ends of a node connection are a pair of channels backed by a reader
//! task and a writer task. The coordinator side is a [`Transport`], the node
//! side a [`NodeEndpoint`]. TCP streams and in-memory duplex pipes share the
//! same `LinesCodec` framing, capped at the configured frame size.

use crate::error::{MeshError, MeshResult};
use crate::protocol::wire::{decode_frame, encode_frame, CoordinatorMessage, NodeMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// Size of each in-memory duplex pipe
const MEMORY_PIPE_BYTES: usize = 256 * 1024;

/// Coordinator side of a node connection
pub struct Transport {
    /// Frames from the node; `None` means the transport is gone
    pub inbound: mpsc::Receiver<MeshResult<NodeMessage>>,
    /// Frames to the node
    pub outbound: mpsc::Sender<CoordinatorMessage>,
    pub peer: String,
}

impl Transport {
    pub async fn recv(&mut self) -> Option<MeshResult<NodeMessage>> {
        self.inbound.recv().await
    }

    pub async fn send(&self, message: CoordinatorMessage) -> MeshResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| MeshError::Io(format!("transport to {} closed", self.peer)))
    }

    /// Queue a frame without waiting. Used on teardown paths.
    pub fn try_send(&self, message: CoordinatorMessage) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    /// Wrap an accepted TCP connection.
    pub fn from_tcp(stream: TcpStream, max_frame_bytes: usize, buffer: usize) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read, write) = stream.into_split();
        let (inbound, outbound) = spawn_line_codec(read, write, max_frame_bytes, buffer, peer.clone());
        Self {
            inbound,
            outbound,
            peer,
        }
    }
}

/// Node side of a connection; used by node agents and tests
pub struct NodeEndpoint {
    pub inbound: mpsc::Receiver<MeshResult<CoordinatorMessage>>,
    pub outbound: mpsc::Sender<NodeMessage>,
}

impl NodeEndpoint {
    /// Connect to a coordinator over TCP.
    pub async fn connect(addr: SocketAddr, max_frame_bytes: usize) -> MeshResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        let (inbound, outbound) =
            spawn_line_codec(read, write, max_frame_bytes, 32, addr.to_string());
        Ok(Self { inbound, outbound })
    }

    pub async fn send(&self, message: NodeMessage) -> MeshResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| MeshError::Io("coordinator connection closed".to_string()))
    }

    /// Next frame from the coordinator; `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<MeshResult<CoordinatorMessage>> {
        self.inbound.recv().await
    }

    /// Next frame within `wait`, flattening errors.
    pub async fn recv_timeout(&mut self, wait: Duration) -> MeshResult<CoordinatorMessage> {
        match tokio::time::timeout(wait, self.inbound.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => Err(MeshError::Io("coordinator connection closed".to_string())),
            Err(_) => Err(MeshError::Io("timed out waiting for coordinator".to_string())),
        }
    }
}

/// An in-memory connection: the coordinator side and the node side.
pub fn memory_transport(max_frame_bytes: usize, buffer: usize) -> (Transport, NodeEndpoint) {
    let (coordinator_io, node_io) = tokio::io::duplex(MEMORY_PIPE_BYTES);
    let (c_read, c_write) = tokio::io::split(coordinator_io);
    let (n_read, n_write) = tokio::io::split(node_io);

    let (inbound, outbound) =
        spawn_line_codec(c_read, c_write, max_frame_bytes, buffer, "memory".to_string());
    let (node_inbound, node_outbound) =
        spawn_line_codec(n_read, n_write, max_frame_bytes, buffer, "memory".to_string());

    (
        Transport {
            inbound,
            outbound,
            peer: "memory".to_string(),
        },
        NodeEndpoint {
            inbound: node_inbound,
            outbound: node_outbound,
        },
    )
}

/// Spawn reader and writer tasks for one end of a line-framed connection.
fn spawn_line_codec<R, W, In, Out>(
    read: R,
    write: W,
    max_frame_bytes: usize,
    buffer: usize,
    peer: String,
) -> (mpsc::Receiver<MeshResult<In>>, mpsc::Sender<Out>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
{
    let (in_tx, in_rx) = mpsc::channel(buffer);
    let (out_tx, out_rx) = mpsc::channel(buffer);

    let reader = FramedRead::new(read, LinesCodec::new_with_max_length(max_frame_bytes));
    let writer = FramedWrite::new(write, LinesCodec::new_with_max_length(max_frame_bytes));
    tokio::spawn(read_frames(reader, in_tx, max_frame_bytes, peer.clone()));
    tokio::spawn(write_frames(writer, out_rx, max_frame_bytes, peer));

    (in_rx, out_tx)
}

fn codec_error(e: LinesCodecError, max_frame_bytes: usize) -> MeshError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            MeshError::Protocol(format!("frame exceeds {} bytes", max_frame_bytes))
        }
        LinesCodecError::Io(e) => MeshError::from(e),
    }
}

async fn read_frames<R, In>(
    mut reader: FramedRead<R, LinesCodec>,
    frames: mpsc::Sender<MeshResult<In>>,
    max_frame_bytes: usize,
    peer: String,
) where
    R: AsyncRead + Unpin,
    In: DeserializeOwned,
{
    while let Some(line) = reader.next().await {
        let frame = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => decode_frame(&line, max_frame_bytes),
            Err(e) => {
                warn!(peer = %peer, error = %e, "read error");
                Err(codec_error(e, max_frame_bytes))
            }
        };
        let fatal = frame.is_err();
        if frames.send(frame).await.is_err() || fatal {
            return;
        }
    }
    debug!(peer = %peer, "connection closed by peer");
}

async fn write_frames<W, Out>(
    mut writer: FramedWrite<W, LinesCodec>,
    mut frames: mpsc::Receiver<Out>,
    max_frame_bytes: usize,
    peer: String,
) where
    W: AsyncWrite + Unpin,
    Out: Serialize,
{
    while let Some(frame) = frames.recv().await {
        let line = match encode_frame(&frame, max_frame_bytes) {
            Ok(line) => line,
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = writer.send(line).await {
            debug!(peer = %peer, error = %e, "write failed");
            break;
        }
    }
    let _ = SinkExt::<String>::close(&mut writer).await;
}
