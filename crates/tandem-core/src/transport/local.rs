//! In-process transport group

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use super::{Buffer, Frame, FrameKind, Rank, Transport};
use crate::{CoreError, Result};

/// Builds a pool of ranks that live in one process.
///
/// Each ordered pair of ranks gets its own FIFO channel, so messages between
/// two ranks arrive in the order they were sent.
pub struct LocalGroup;

impl LocalGroup {
    pub fn new(world_size: usize) -> Vec<LocalTransport> {
        // senders[src][dst] / receivers[dst][src]
        let mut senders: Vec<Vec<Option<mpsc::UnboundedSender<Frame>>>> =
            (0..world_size).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Option<Mutex<mpsc::UnboundedReceiver<Frame>>>>> =
            (0..world_size).map(|_| Vec::new()).collect();

        for src in 0..world_size {
            for dst in 0..world_size {
                if src == dst {
                    senders[src].push(None);
                    receivers[dst].push(None);
                } else {
                    let (tx, rx) = mpsc::unbounded_channel();
                    senders[src].push(Some(tx));
                    receivers[dst].push(Some(Mutex::new(rx)));
                }
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outgoing, incoming))| LocalTransport {
                rank,
                world_size,
                outgoing,
                incoming,
            })
            .collect()
    }
}

/// One rank of a [`LocalGroup`]
pub struct LocalTransport {
    rank: Rank,
    world_size: usize,
    outgoing: Vec<Option<mpsc::UnboundedSender<Frame>>>,
    incoming: Vec<Option<Mutex<mpsc::UnboundedReceiver<Frame>>>>,
}

impl LocalTransport {
    fn deliver(&self, frame: Frame, dst: Rank) -> Result<()> {
        let sender = self
            .outgoing
            .get(dst)
            .and_then(Option::as_ref)
            .ok_or_else(|| route_error(self.rank, dst))?;
        sender.send(frame).map_err(|_| {
            CoreError::transport(
                "TRANSPORT_CLOSED",
                format!("rank {dst} has left the group"),
                format!("rank {} sending", self.rank),
            )
        })
    }

    async fn take(&self, src: Rank) -> Result<Frame> {
        let receiver = self
            .incoming
            .get(src)
            .and_then(Option::as_ref)
            .ok_or_else(|| route_error(src, self.rank))?;
        receiver.lock().await.recv().await.ok_or_else(|| {
            CoreError::transport(
                "TRANSPORT_CLOSED",
                format!("rank {src} has left the group"),
                format!("rank {} receiving", self.rank),
            )
        })
    }
}

fn route_error(src: Rank, dst: Rank) -> CoreError {
    CoreError::transport(
        "TRANSPORT_ROUTE",
        format!("no channel from rank {src} to rank {dst}"),
        "Local transport routing",
    )
}

#[async_trait]
impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&self, buf: &mut Buffer, root: Rank) -> Result<()> {
        if self.rank == root {
            trace!(rank = self.rank, shape = %buf.shape(), "broadcast send");
            for dst in (0..self.world_size).filter(|dst| *dst != root) {
                self.deliver(Frame::new(FrameKind::Broadcast, buf.clone()), dst)?;
            }
            Ok(())
        } else {
            let frame = self.take(root).await?;
            frame.accept_into(FrameKind::Broadcast, buf)
        }
    }

    async fn send(&self, buf: &Buffer, dst: Rank) -> Result<()> {
        self.deliver(Frame::new(FrameKind::PointToPoint, buf.clone()), dst)
    }

    async fn recv(&self, buf: &mut Buffer, src: Rank) -> Result<()> {
        let frame = self.take(src).await?;
        frame.accept_into(FrameKind::PointToPoint, buf)
    }
}
