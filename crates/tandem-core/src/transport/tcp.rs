//! TCP transport in a star topology with the primary as hub
//!
//! Workers connect only to rank 0. A broadcast rooted at rank 0 is written to
//! every worker connection; a broadcast rooted at a worker is sent to the hub,
//! which forwards it to the remaining workers. Point-to-point traffic is
//! limited to hub and worker pairs.
//!
//! Each connection has a writer task fed through a queue of whole encoded
//! frames, so a caller cancelled by a timeout never leaves a partial frame
//! on the socket.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::frame::{FrameHeader, HEADER_LEN};
use super::{Buffer, Frame, FrameKind, Rank, Shape, Transport, PRIMARY_RANK};
use crate::{CoreError, Result};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// One connected peer: the outbox its writer task drains and the inbox its
/// reader task fills
struct Peer {
    outbox: mpsc::UnboundedSender<Arc<[u8]>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Result<Frame>>>,
    reader: JoinHandle<()>,
}

/// A rank connected to the pool over TCP
pub struct TcpTransport {
    rank: Rank,
    world_size: usize,
    /// Indexed by peer rank. The hub holds every worker; a worker only the hub.
    peers: Vec<Option<Peer>>,
}

/// The primary's listener, waiting for every worker to introduce itself
pub struct PendingPrimary {
    listener: TcpListener,
}

impl TcpTransport {
    /// Start listening as the hub (rank 0)
    pub async fn bind(addr: &str) -> Result<PendingPrimary> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            CoreError::transport_io("TRANSPORT_BIND", format!("binding {addr}"), PRIMARY_RANK, e)
        })?;
        info!(addr = %addr, "Primary listening for workers");
        Ok(PendingPrimary { listener })
    }

    /// Dial the hub as `rank`, retrying until `timeout` elapses
    pub async fn connect(rank: Rank, world_size: usize, addr: &str, timeout: Duration) -> Result<Self> {
        if rank == PRIMARY_RANK || rank >= world_size {
            return Err(CoreError::configuration(
                "CONFIG_RANK",
                format!("rank {rank} cannot dial the primary in a pool of {world_size}"),
                "TCP transport connect",
                "Workers use ranks 1..world_size",
            ));
        }

        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    trace!(error = %e, addr = %addr, "Primary not reachable yet, retrying");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(CoreError::transport_io(
                        "TRANSPORT_CONNECT",
                        format!("connecting to primary at {addr} within {timeout:?}"),
                        PRIMARY_RANK,
                        e,
                    ))
                }
            }
        };
        stream.set_nodelay(true)?;

        let hello = Frame::new(
            FrameKind::Hello,
            Buffer::Int64(vec![rank as i64, world_size as i64]),
        );
        stream
            .write_all(&hello.encode()?)
            .await
            .map_err(|e| io_error(e, PRIMARY_RANK, "sending hello"))?;
        info!(rank, addr = %addr, "Connected to primary");

        let mut peers: Vec<Option<Peer>> = (0..world_size).map(|_| None).collect();
        peers[PRIMARY_RANK] = Some(Peer::spawn(stream, PRIMARY_RANK));
        Ok(Self {
            rank,
            world_size,
            peers,
        })
    }

    fn peer(&self, rank: Rank) -> Result<&Peer> {
        self.peers
            .get(rank)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                CoreError::transport(
                    "TRANSPORT_ROUTE",
                    format!("rank {} has no direct connection to rank {rank}", self.rank),
                    "TCP star topology routes through rank 0",
                )
            })
    }

    /// Queue a whole encoded frame for `dst`
    fn enqueue(&self, bytes: Arc<[u8]>, dst: Rank) -> Result<()> {
        let peer = self.peer(dst)?;
        peer.outbox.send(bytes).map_err(|_| {
            CoreError::transport(
                "TRANSPORT_CLOSED",
                format!("connection to rank {dst} is closed"),
                format!("rank {} sending", self.rank),
            )
        })
    }

    async fn take(&self, src: Rank) -> Result<Frame> {
        let peer = self.peer(src)?;
        let mut inbox = peer.inbox.lock().await;
        match inbox.recv().await {
            Some(frame) => frame,
            None => Err(CoreError::transport(
                "TRANSPORT_CLOSED",
                format!("rank {src} closed the connection"),
                format!("rank {} receiving", self.rank),
            )),
        }
    }
}

impl PendingPrimary {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection per worker rank and build the hub transport
    pub async fn accept(self, world_size: usize, timeout: Duration) -> Result<TcpTransport> {
        let mut peers: Vec<Option<Peer>> = (0..world_size).map(|_| None).collect();
        let mut pending = world_size.saturating_sub(1);

        let accepted = tokio::time::timeout(timeout, async {
            while pending > 0 {
                let (mut stream, addr) = self.listener.accept().await?;
                stream.set_nodelay(true)?;

                let hello = read_frame(&mut stream).await?.ok_or_else(|| {
                    CoreError::transport(
                        "TRANSPORT_HANDSHAKE",
                        format!("{addr} disconnected before introducing itself"),
                        "Accepting workers",
                    )
                })?;
                let (rank, their_world) = parse_hello(&hello)?;
                if their_world != world_size {
                    return Err(CoreError::configuration(
                        "CONFIG_MISMATCH",
                        format!("worker at {addr} expects world size {their_world}, primary has {world_size}"),
                        "Accepting workers",
                        "Start every rank with the same cluster.world_size",
                    ));
                }
                if rank == PRIMARY_RANK || rank >= world_size || peers[rank].is_some() {
                    return Err(CoreError::configuration(
                        "CONFIG_RANK",
                        format!("worker at {addr} claims rank {rank}, which is invalid or taken"),
                        "Accepting workers",
                        "Give every worker a distinct rank in 1..world_size",
                    ));
                }

                debug!(rank, addr = %addr, "Worker joined");
                peers[rank] = Some(Peer::spawn(stream, rank));
                pending -= 1;
            }
            Ok::<_, CoreError>(())
        })
        .await;

        match accepted {
            Ok(result) => result?,
            Err(_) => {
                return Err(CoreError::transport(
                    "TRANSPORT_CONNECT",
                    format!("{pending} worker(s) did not connect within {timeout:?}"),
                    "Accepting workers",
                ))
            }
        }

        info!(world_size, "All workers connected");
        Ok(TcpTransport {
            rank: PRIMARY_RANK,
            world_size,
            peers,
        })
    }
}

impl Peer {
    fn spawn(stream: TcpStream, rank: Rank) -> Self {
        let (mut read_half, write_half) = stream.into_split();
        let (outbox, queued) = mpsc::unbounded_channel();
        // detached: it flushes what is queued and exits when the peer is dropped
        tokio::spawn(write_frames(write_half, queued, rank));

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(peer = rank, "Connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = rank, error = %e, "Dropping connection after read error");
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });
        Self {
            outbox,
            inbox: Mutex::new(rx),
            reader,
        }
    }
}

async fn write_frames(mut writer: OwnedWriteHalf, mut queued: mpsc::UnboundedReceiver<Arc<[u8]>>, peer: Rank) {
    while let Some(bytes) = queued.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            let err = io_error(e, peer, "writing frame");
            warn!(peer, code = err.code(), error = %err, "Dropping connection after write error");
            return;
        }
    }
    trace!(peer, "Writer finished");
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Read one frame; `None` on a clean end of stream between frames
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::read_from(&header)?;
    let mut body = vec![0u8; header.body_len()];
    reader.read_exact(&mut body).await?;
    Frame::decode_body(header, &body).map(Some)
}

fn parse_hello(frame: &Frame) -> Result<(Rank, usize)> {
    match (frame.kind, frame.buffer.as_i64()) {
        (FrameKind::Hello, Some([rank, world_size])) if *rank >= 0 && *world_size > 0 => {
            Ok((*rank as Rank, *world_size as usize))
        }
        _ => Err(CoreError::Desync {
            step: None,
            expected: format!("{} {}", FrameKind::Hello, Shape::int64(2)),
            found: format!("{} {}", frame.kind, frame.buffer.shape()),
        }),
    }
}

fn io_error(err: std::io::Error, peer: Rank, context: &str) -> CoreError {
    let code = match err.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => "TRANSPORT_CLOSED",
        _ => "TRANSPORT_IO",
    };
    CoreError::transport_io(code, context, peer, err)
}

#[async_trait]
impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&self, buf: &mut Buffer, root: Rank) -> Result<()> {
        let is_hub = self.rank == PRIMARY_RANK;

        if self.rank == root {
            let bytes: Arc<[u8]> = Frame::new(FrameKind::Broadcast, buf.clone()).encode()?.into();
            if is_hub {
                for dst in 1..self.world_size {
                    self.enqueue(Arc::clone(&bytes), dst)?;
                }
            } else {
                self.enqueue(bytes, PRIMARY_RANK)?;
            }
            return Ok(());
        }

        if is_hub {
            // relay a worker-rooted broadcast to everyone else
            let frame = self.take(root).await?;
            frame.accept_into(FrameKind::Broadcast, buf)?;
            let bytes: Arc<[u8]> = Frame::new(FrameKind::Broadcast, buf.clone()).encode()?.into();
            for dst in (1..self.world_size).filter(|dst| *dst != root) {
                self.enqueue(Arc::clone(&bytes), dst)?;
            }
            Ok(())
        } else {
            let frame = self.take(PRIMARY_RANK).await?;
            frame.accept_into(FrameKind::Broadcast, buf)
        }
    }

    async fn send(&self, buf: &Buffer, dst: Rank) -> Result<()> {
        let bytes = Frame::new(FrameKind::PointToPoint, buf.clone()).encode()?;
        self.enqueue(bytes.into(), dst)
    }

    async fn recv(&self, buf: &mut Buffer, src: Rank) -> Result<()> {
        let frame = self.take(src).await?;
        frame.accept_into(FrameKind::PointToPoint, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool(world_size: usize) -> Vec<TcpTransport> {
        let pending = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = pending.local_addr().unwrap().to_string();

        let mut dialers = Vec::new();
        for rank in 1..world_size {
            let addr = addr.clone();
            dialers.push(tokio::spawn(async move {
                TcpTransport::connect(rank, world_size, &addr, Duration::from_secs(5))
                    .await
                    .unwrap()
            }));
        }

        let primary = pending
            .accept(world_size, Duration::from_secs(5))
            .await
            .unwrap();
        let mut transports = vec![primary];
        for dialer in dialers {
            transports.push(dialer.await.unwrap());
        }
        transports
    }

    #[tokio::test]
    async fn test_hub_broadcast_and_point_to_point() {
        let mut transports = pool(3).await;
        let w2 = transports.pop().unwrap();
        let w1 = transports.pop().unwrap();
        let primary = transports.pop().unwrap();

        let workers = [w1, w2].map(|worker| {
            tokio::spawn(async move {
                let mut wake = Buffer::zeros(Shape::int64(1));
                worker.recv(&mut wake, 0).await.unwrap();
                let mut temperature = Buffer::zeros(Shape::float32(1));
                worker.broadcast(&mut temperature, 0).await.unwrap();
                (wake, temperature)
            })
        });

        for dst in 1..3 {
            primary.send(&Buffer::Int64(vec![1]), dst).await.unwrap();
        }
        let mut temperature = Buffer::Float32(vec![0.7]);
        primary.broadcast(&mut temperature, 0).await.unwrap();

        for worker in workers {
            let (wake, temperature) = worker.await.unwrap();
            assert_eq!(wake, Buffer::Int64(vec![1]));
            assert_eq!(temperature, Buffer::Float32(vec![0.7]));
        }
    }

    #[tokio::test]
    async fn test_worker_rooted_broadcast_is_relayed() {
        let mut transports = pool(3).await;
        let w2 = transports.pop().unwrap();
        let w1 = transports.pop().unwrap();
        let primary = transports.pop().unwrap();

        let sender = tokio::spawn(async move {
            let mut buf = Buffer::Int64(vec![9, 8]);
            w1.broadcast(&mut buf, 1).await.unwrap();
            w1
        });
        let receiver = tokio::spawn(async move {
            let mut buf = Buffer::zeros(Shape::int64(2));
            w2.broadcast(&mut buf, 1).await.unwrap();
            buf
        });

        let mut buf = Buffer::zeros(Shape::int64(2));
        primary.broadcast(&mut buf, 1).await.unwrap();
        assert_eq!(buf, Buffer::Int64(vec![9, 8]));
        assert_eq!(receiver.await.unwrap(), Buffer::Int64(vec![9, 8]));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_caller_never_splits_a_frame() {
        let mut transports = pool(2).await;
        let worker = transports.pop().unwrap();
        let primary = transports.pop().unwrap();

        // far larger than a socket buffer
        let big = Buffer::Int64((0..1 << 20).collect());
        let mut sent = big.clone();
        let _ = tokio::time::timeout(Duration::from_micros(1), primary.broadcast(&mut sent, 0)).await;
        primary.send(&Buffer::Int64(vec![2]), 1).await.unwrap();

        let mut received = Buffer::zeros(Shape::int64(1 << 20));
        worker.broadcast(&mut received, 0).await.unwrap();
        assert_eq!(received, big);
        let mut wake = Buffer::zeros(Shape::int64(1));
        worker.recv(&mut wake, 0).await.unwrap();
        assert_eq!(wake, Buffer::Int64(vec![2]));
    }

    #[tokio::test]
    async fn test_closed_connection_reported() {
        let mut transports = pool(2).await;
        let worker = transports.pop().unwrap();
        drop(transports);

        let mut buf = Buffer::zeros(Shape::int64(1));
        let err = worker.recv(&mut buf, 0).await.unwrap_err();
        assert!(err.is_transport_closed());
    }

    #[tokio::test]
    async fn test_worker_to_worker_has_no_route() {
        let mut transports = pool(3).await;
        let w2 = transports.pop().unwrap();
        let err = w2.send(&Buffer::Int64(vec![1]), 1).await.unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_ROUTE");
    }
}
