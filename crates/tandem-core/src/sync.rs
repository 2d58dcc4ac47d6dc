//! Request dissemination from the primary to every rank
//!
//! A request crosses the pool in a fixed sequence of steps:
//!
//! 1. [`SyncStep::Wake`], point-to-point from the primary to each worker
//! 2. [`SyncStep::Payload`], the encoded prompt in a fixed-capacity buffer
//! 3. [`SyncStep::Temperature`]
//! 4. [`SyncStep::TopP`]
//! 5. [`SyncStep::MaxOutputLength`]
//!
//! Every rank, the primary included, rebuilds its [`SyncedRequest`] from the
//! broadcast buffers, so all copies are bit-identical.
//!
//! The wake signal carries a request sequence number. A worker whose bounded
//! step timed out gives up on that request and, before the next one, drains
//! whatever the primary still sent for it until a newer wake signal arrives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastChannel, SyncStep};
use crate::config::{OverflowPolicy, SyncConfig};
use crate::tokenizer::Tokenizer;
use crate::transport::Buffer;
use crate::{CoreError, Result};

/// Reserved pad unit; never a valid token id
pub const PAD_UNIT: i64 = -1;

/// One user turn's generation request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub payload: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_length: usize,
    pub stop_marker: String,
}

/// Notice that the payload did not fit the transport buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadTruncation {
    pub encoded_len: usize,
    pub capacity: usize,
}

impl From<PayloadTruncation> for CoreError {
    fn from(t: PayloadTruncation) -> Self {
        CoreError::PayloadTruncated {
            encoded_len: t.encoded_len,
            capacity: t.capacity,
        }
    }
}

/// A request as observed by one rank after the broadcast completed
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedRequest {
    /// Position of the request in the primary's publish order, from 1
    pub sequence: u64,
    pub request: Request,
    /// Prompt token ids exactly as broadcast
    pub prompt_tokens: Vec<u32>,
    /// Set on the primary when the payload was cut to capacity
    pub truncated: Option<PayloadTruncation>,
}

/// Pack token ids into a buffer of `capacity` units padded with [`PAD_UNIT`].
///
/// Ids beyond `capacity` are dropped and reported.
pub fn pack_payload(tokens: &[u32], capacity: usize) -> (Buffer, Option<PayloadTruncation>) {
    let mut units = vec![PAD_UNIT; capacity];
    let kept = tokens.len().min(capacity);
    for (slot, token) in units.iter_mut().zip(&tokens[..kept]) {
        *slot = i64::from(*token);
    }
    let truncated = (tokens.len() > capacity).then_some(PayloadTruncation {
        encoded_len: tokens.len(),
        capacity,
    });
    (Buffer::Int64(units), truncated)
}

/// Recover token ids up to the first pad unit, or the full buffer if none
pub fn unpack_payload(units: &[i64]) -> Result<Vec<u32>> {
    units
        .iter()
        .take_while(|unit| **unit != PAD_UNIT)
        .map(|unit| {
            u32::try_from(*unit).map_err(|_| {
                CoreError::invalid_input(
                    "SYNC_BAD_PAYLOAD",
                    format!("payload unit {unit} is not a token id"),
                    "Unpacking broadcast payload",
                    "Check every rank uses the same tokenizer",
                )
            })
        })
        .collect()
}

/// Reject sampling parameters before anything is sent
pub fn validate_sampling(temperature: f32, top_p: f32, max_output_length: usize) -> Result<()> {
    if !temperature.is_finite() || temperature < 0.0 {
        return Err(CoreError::invalid_parameter(
            "INVALID_TEMPERATURE",
            format!("temperature {temperature} is not usable"),
            "Validating sampling parameters",
            "Use a finite temperature >= 0.0",
            "temperature",
            temperature.to_string(),
            ">= 0.0",
        ));
    }
    if !(top_p > 0.0 && top_p <= 1.0) {
        return Err(CoreError::invalid_parameter(
            "INVALID_TOP_P",
            format!("top_p {top_p} is out of range"),
            "Validating sampling parameters",
            "Use a top_p in (0.0, 1.0]",
            "top_p",
            top_p.to_string(),
            "(0.0, 1.0]",
        ));
    }
    if max_output_length == 0 || i64::try_from(max_output_length).is_err() {
        return Err(CoreError::invalid_parameter(
            "INVALID_MAX_OUTPUT_LENGTH",
            format!("max_output_length {max_output_length} is out of range"),
            "Validating sampling parameters",
            "Request at least one output token",
            "max_output_length",
            max_output_length.to_string(),
            ">= 1",
        ));
    }
    Ok(())
}

/// Drives the per-request broadcast protocol on one rank
pub struct RequestSynchronizer {
    channel: BroadcastChannel,
    tokenizer: Arc<dyn Tokenizer>,
    overflow: OverflowPolicy,
    stop_marker: String,
    /// Last sequence number published (primary) or woken for (worker)
    sequence: AtomicU64,
    /// Set after a worker abandoned a request mid-protocol
    resync: AtomicBool,
}

impl RequestSynchronizer {
    pub fn new(
        channel: BroadcastChannel,
        tokenizer: Arc<dyn Tokenizer>,
        sync: &SyncConfig,
        stop_marker: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            tokenizer,
            overflow: sync.overflow,
            stop_marker: stop_marker.into(),
            sequence: AtomicU64::new(0),
            resync: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &BroadcastChannel {
        &self.channel
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn stop_marker(&self) -> &str {
        &self.stop_marker
    }

    /// Agree on pool-wide settings before serving.
    ///
    /// The primary broadcasts `[world_size, payload_capacity, seed,
    /// fingerprint]`; every other rank compares them with its own view.
    pub async fn handshake(&self, seed: u64, fingerprint: u64) -> Result<()> {
        let ours = [
            self.channel.world_size() as i64,
            self.channel.payload_capacity() as i64,
            seed as i64,
            fingerprint as i64,
        ];
        let mut buf = if self.channel.is_primary() {
            Buffer::Int64(ours.to_vec())
        } else {
            self.channel.placeholder(SyncStep::Handshake)
        };
        self.channel.broadcast(SyncStep::Handshake, &mut buf).await?;

        let theirs = int_units(&buf, SyncStep::Handshake)?;
        const FIELDS: [&str; 4] = [
            "cluster.world_size",
            "sync.payload_capacity",
            "model.seed",
            "chat settings (stop marker, tags, preamble)",
        ];
        for ((field, mine), primary) in FIELDS.iter().zip(ours).zip(theirs) {
            if mine != *primary {
                return Err(CoreError::configuration_field(
                    "CONFIG_MISMATCH",
                    format!("{field} differs from the primary ({mine} vs {primary})"),
                    format!("Handshake on rank {}", self.channel.rank()),
                    "Start every rank with the same configuration",
                    *field,
                ));
            }
        }
        info!(rank = self.channel.rank(), "Handshake complete");
        Ok(())
    }

    /// Primary side: validate, wake the workers and broadcast `request`.
    ///
    /// Every validation failure, including a rejected oversized payload,
    /// happens before the wake signal, so the pool is never left mid-protocol.
    pub async fn publish(&self, request: Request) -> Result<SyncedRequest> {
        if !self.channel.is_primary() {
            return Err(CoreError::Internal {
                code: "SYNC_NOT_PRIMARY",
                message: format!("rank {} cannot publish requests", self.channel.rank()),
                context: "RequestSynchronizer::publish".to_string(),
                source: None,
            });
        }
        validate_sampling(request.temperature, request.top_p, request.max_output_length)?;
        if request.stop_marker != self.stop_marker {
            return Err(CoreError::invalid_parameter(
                "INVALID_STOP_MARKER",
                "stop marker differs from the one the pool agreed on",
                "Validating request",
                "Use the configured chat.stop_marker",
                "stop_marker",
                request.stop_marker.clone(),
                self.stop_marker.clone(),
            ));
        }

        let tokens = self.tokenizer.encode(&request.payload, true)?;
        let (mut payload, truncated) = pack_payload(&tokens, self.channel.payload_capacity());
        if let Some(notice) = truncated {
            match self.overflow {
                OverflowPolicy::Reject => return Err(notice.into()),
                OverflowPolicy::Truncate => warn!(
                    encoded_len = notice.encoded_len,
                    capacity = notice.capacity,
                    "Payload exceeds transport capacity; keeping the leading units"
                ),
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        for dst in 1..self.channel.world_size() {
            self.channel.signal(dst, sequence).await?;
        }

        let mut temperature = Buffer::Float32(vec![request.temperature]);
        let mut top_p = Buffer::Float32(vec![request.top_p]);
        let mut max_len = Buffer::Int64(vec![request.max_output_length as i64]);
        let mut synced = self
            .exchange(sequence, &mut payload, &mut temperature, &mut top_p, &mut max_len)
            .await?;
        synced.truncated = truncated;
        Ok(synced)
    }

    /// Worker side: block until the primary wakes this rank, then receive
    /// the request.
    ///
    /// A [`CoreError::SyncTimeout`] abandons the request; the next call
    /// drains its leftover frames before waiting for the next wake signal.
    pub async fn await_request(&self) -> Result<SyncedRequest> {
        let drain = self.resync.load(Ordering::Acquire);
        let after = self.sequence.load(Ordering::Acquire);
        let sequence = self.channel.await_signal(drain, after).await?;
        self.sequence.store(sequence, Ordering::Release);
        if drain {
            self.resync.store(false, Ordering::Release);
            info!(rank = self.channel.rank(), sequence, "Resynchronised with the primary");
        }

        let mut payload = self.channel.placeholder(SyncStep::Payload);
        let mut temperature = self.channel.placeholder(SyncStep::Temperature);
        let mut top_p = self.channel.placeholder(SyncStep::TopP);
        let mut max_len = self.channel.placeholder(SyncStep::MaxOutputLength);
        let received = self
            .exchange(sequence, &mut payload, &mut temperature, &mut top_p, &mut max_len)
            .await;
        if let Err(CoreError::SyncTimeout { step, .. }) = &received {
            warn!(
                rank = self.channel.rank(),
                sequence,
                step = %step,
                "Request abandoned; draining until the next wake signal"
            );
            self.resync.store(true, Ordering::Release);
        }
        received
    }

    async fn exchange(
        &self,
        sequence: u64,
        payload: &mut Buffer,
        temperature: &mut Buffer,
        top_p: &mut Buffer,
        max_len: &mut Buffer,
    ) -> Result<SyncedRequest> {
        self.channel.broadcast(SyncStep::Payload, payload).await?;
        self.channel.broadcast(SyncStep::Temperature, temperature).await?;
        self.channel.broadcast(SyncStep::TopP, top_p).await?;
        self.channel.broadcast(SyncStep::MaxOutputLength, max_len).await?;

        let prompt_tokens = unpack_payload(int_units(payload, SyncStep::Payload)?)?;
        let temperature = float_unit(temperature, SyncStep::Temperature)?;
        let top_p = float_unit(top_p, SyncStep::TopP)?;
        let max_output_length = int_units(max_len, SyncStep::MaxOutputLength)?[0];
        let max_output_length = usize::try_from(max_output_length).map_err(|_| {
            CoreError::invalid_input(
                "SYNC_BAD_VALUE",
                format!("max_output_length {max_output_length} received"),
                "Unpacking broadcast request",
                "Check every rank runs the same build",
            )
        })?;
        let payload = self.tokenizer.decode(&prompt_tokens)?;

        debug!(
            rank = self.channel.rank(),
            sequence,
            prompt_tokens = prompt_tokens.len(),
            temperature,
            top_p,
            max_output_length,
            "Request synchronised"
        );
        Ok(SyncedRequest {
            sequence,
            request: Request {
                payload,
                temperature,
                top_p,
                max_output_length,
                stop_marker: self.stop_marker.clone(),
            },
            prompt_tokens,
            truncated: None,
        })
    }
}

fn int_units(buf: &Buffer, step: SyncStep) -> Result<&[i64]> {
    buf.as_i64().ok_or_else(|| CoreError::Desync {
        step: Some(step),
        expected: "int64 units".to_string(),
        found: buf.shape().to_string(),
    })
}

fn float_unit(buf: &Buffer, step: SyncStep) -> Result<f32> {
    buf.as_f32()
        .and_then(|values| values.first().copied())
        .ok_or_else(|| CoreError::Desync {
            step: Some(step),
            expected: "float32[1]".to_string(),
            found: buf.shape().to_string(),
        })
}
