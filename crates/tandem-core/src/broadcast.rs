//! Fixed-shape broadcast channel with named synchronisation steps
//!
//! Every cross-process handoff goes through one of the [`SyncStep`]s below.
//! Each step has a declared shape that every rank checks locally before
//! entering the collective call, so a caller that diverges is caught at the
//! step it diverged on rather than by reinterpreting another step's bytes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::transport::{Buffer, Rank, Shape, Transport, PRIMARY_RANK};
use crate::{CoreError, Result};

/// Named synchronisation points, in the order a request crosses them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStep {
    /// Startup agreement on pool settings
    Handshake,
    /// Point-to-point "a request is coming" signal
    Wake,
    Payload,
    Temperature,
    TopP,
    MaxOutputLength,
}

/// Number of elements in the handshake buffer:
/// `[world_size, payload_capacity, seed, fingerprint]`
pub const HANDSHAKE_LEN: usize = 4;

impl SyncStep {
    /// The shape every rank must present for this step
    pub fn declared_shape(&self, payload_capacity: usize) -> Shape {
        match self {
            SyncStep::Handshake => Shape::int64(HANDSHAKE_LEN),
            SyncStep::Wake => Shape::int64(1),
            SyncStep::Payload => Shape::int64(payload_capacity),
            SyncStep::Temperature | SyncStep::TopP => Shape::float32(1),
            SyncStep::MaxOutputLength => Shape::int64(1),
        }
    }
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStep::Handshake => "handshake",
            SyncStep::Wake => "wake",
            SyncStep::Payload => "payload",
            SyncStep::Temperature => "temperature",
            SyncStep::TopP => "top_p",
            SyncStep::MaxOutputLength => "max_output_length",
        };
        f.write_str(name)
    }
}

/// Broadcasts rooted at the primary, one named step at a time
#[derive(Clone)]
pub struct BroadcastChannel {
    transport: Arc<dyn Transport>,
    payload_capacity: usize,
    timeout: Option<Duration>,
}

impl BroadcastChannel {
    pub fn new(transport: Arc<dyn Transport>, payload_capacity: usize, timeout: Option<Duration>) -> Self {
        Self {
            transport,
            payload_capacity,
            timeout,
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn is_primary(&self) -> bool {
        self.rank() == PRIMARY_RANK
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// A placeholder of the declared shape for `step`
    pub fn placeholder(&self, step: SyncStep) -> Buffer {
        Buffer::zeros(step.declared_shape(self.payload_capacity))
    }

    /// Run `step` as a broadcast from the primary.
    ///
    /// On the primary `buf` is the value sent; on every other rank it is a
    /// placeholder overwritten with the primary's value.
    pub async fn broadcast(&self, step: SyncStep, buf: &mut Buffer) -> Result<()> {
        self.check_shape(step, buf)?;
        trace!(rank = self.rank(), step = %step, "entering broadcast");
        let transport = &self.transport;
        self.bounded(step, async move { transport.broadcast(buf, PRIMARY_RANK).await })
            .await
            .map_err(|e| e.in_step(step))
    }

    /// Primary side of [`SyncStep::Wake`]: tell `dst` that request
    /// `sequence` is coming
    pub async fn signal(&self, dst: Rank, sequence: u64) -> Result<()> {
        let buf = Buffer::Int64(vec![sequence as i64]);
        trace!(rank = self.rank(), dst, sequence, "sending wake signal");
        let transport = &self.transport;
        self.bounded(SyncStep::Wake, async move { transport.send(&buf, dst).await })
            .await
            .map_err(|e| e.in_step(SyncStep::Wake))
    }

    /// Worker side of [`SyncStep::Wake`]. Blocks until the primary has work
    /// and returns the sequence number of the request; never bounded, since
    /// an idle pool may wait indefinitely.
    ///
    /// A wake signal must carry a sequence number above `after`. With
    /// `drain` set, frames left behind by an abandoned request are discarded
    /// until such a signal arrives; otherwise any other frame is a desync.
    pub async fn await_signal(&self, drain: bool, after: u64) -> Result<u64> {
        loop {
            let mut buf = self.placeholder(SyncStep::Wake);
            match self.transport.recv(&mut buf, PRIMARY_RANK).await {
                Ok(()) => {}
                Err(CoreError::Desync { found, .. }) if drain => {
                    debug!(rank = self.rank(), %found, "discarding stale frame");
                    continue;
                }
                Err(e) => return Err(e.in_step(SyncStep::Wake)),
            }

            let sequence = match buf.as_i64() {
                Some([sequence]) if *sequence > 0 => *sequence as u64,
                _ => 0,
            };
            if sequence > after {
                trace!(rank = self.rank(), sequence, "woken by primary");
                return Ok(sequence);
            }
            if drain {
                debug!(rank = self.rank(), sequence, after, "discarding stale wake signal");
                continue;
            }
            return Err(CoreError::Desync {
                step: Some(SyncStep::Wake),
                expected: format!("request sequence above {after}"),
                found: format!("request sequence {sequence}"),
            });
        }
    }

    fn check_shape(&self, step: SyncStep, buf: &Buffer) -> Result<()> {
        let declared = step.declared_shape(self.payload_capacity);
        let found = buf.shape();
        if declared != found {
            return Err(CoreError::Desync {
                step: Some(step),
                expected: declared.to_string(),
                found: found.to_string(),
            });
        }
        Ok(())
    }

    async fn bounded<T, F>(&self, step: SyncStep, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.timeout {
            None => fut.await,
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| CoreError::SyncTimeout { step, waited: limit })?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalGroup;

    fn channels(world_size: usize, timeout: Option<Duration>) -> Vec<BroadcastChannel> {
        LocalGroup::new(world_size)
            .into_iter()
            .map(|t| BroadcastChannel::new(Arc::new(t), 8, timeout))
            .collect()
    }

    #[test]
    fn test_declared_shapes() {
        assert_eq!(SyncStep::Payload.declared_shape(4096), Shape::int64(4096));
        assert_eq!(SyncStep::TopP.declared_shape(4096), Shape::float32(1));
        assert_eq!(SyncStep::Handshake.declared_shape(1), Shape::int64(HANDSHAKE_LEN));
        assert_eq!(SyncStep::MaxOutputLength.to_string(), "max_output_length");
    }

    #[tokio::test]
    async fn test_wrong_local_shape_is_rejected_before_sending() {
        let mut chans = channels(2, None);
        let primary = chans.remove(0);

        let mut buf = Buffer::Int64(vec![1, 2, 3]);
        let err = primary.broadcast(SyncStep::Payload, &mut buf).await.unwrap_err();
        match err {
            CoreError::Desync { step, expected, found } => {
                assert_eq!(step, Some(SyncStep::Payload));
                assert_eq!(expected, "int64[8]");
                assert_eq!(found, "int64[3]");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_mismatched_steps_are_named() {
        let mut chans = channels(2, None);
        let worker = chans.pop().unwrap();
        let primary = chans.pop().unwrap();

        let mut temperature = Buffer::Float32(vec![0.5]);
        primary
            .broadcast(SyncStep::Temperature, &mut temperature)
            .await
            .unwrap();

        // the worker skipped ahead to the length step
        let mut placeholder = worker.placeholder(SyncStep::MaxOutputLength);
        let err = worker
            .broadcast(SyncStep::MaxOutputLength, &mut placeholder)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SYNC_DESYNC");
        assert!(err.to_string().contains("max_output_length"));
    }

    #[tokio::test]
    async fn test_bounded_step_times_out() {
        let mut chans = channels(2, Some(Duration::from_millis(20)));
        let worker = chans.pop().unwrap();
        let _primary = chans.pop().unwrap();

        let mut buf = worker.placeholder(SyncStep::TopP);
        let err = worker.broadcast(SyncStep::TopP, &mut buf).await.unwrap_err();
        match err {
            CoreError::SyncTimeout { step, waited } => {
                assert_eq!(step, SyncStep::TopP);
                assert_eq!(waited, Duration::from_millis(20));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wake_wait_is_not_bounded() {
        let mut chans = channels(2, Some(Duration::from_millis(10)));
        let worker = chans.pop().unwrap();
        let primary = chans.pop().unwrap();

        let waiter = tokio::spawn(async move { worker.await_signal(false, 0).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        primary.signal(1, 1).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_skips_leftovers_of_an_abandoned_request() {
        let mut chans = channels(2, None);
        let worker = chans.pop().unwrap();
        let primary = chans.pop().unwrap();

        // the tail of request 1 that the worker gave up on
        let mut payload = Buffer::Int64(vec![-1; 8]);
        primary.broadcast(SyncStep::Payload, &mut payload).await.unwrap();
        let mut top_p = Buffer::Float32(vec![0.9]);
        primary.broadcast(SyncStep::TopP, &mut top_p).await.unwrap();
        primary.signal(1, 1).await.unwrap();
        primary.signal(1, 2).await.unwrap();

        assert_eq!(worker.await_signal(true, 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_leftover_frames_without_drain_are_desync() {
        let mut chans = channels(2, None);
        let worker = chans.pop().unwrap();
        let primary = chans.pop().unwrap();

        let mut temperature = Buffer::Float32(vec![0.5]);
        primary
            .broadcast(SyncStep::Temperature, &mut temperature)
            .await
            .unwrap();
        let err = worker.await_signal(false, 0).await.unwrap_err();
        assert_eq!(err.code(), "SYNC_DESYNC");
        assert!(err.to_string().contains("wake"));

        primary.signal(1, 3).await.unwrap();
        let err = worker.await_signal(false, 3).await.unwrap_err();
        assert!(err.to_string().contains("request sequence 3"));
    }
}
