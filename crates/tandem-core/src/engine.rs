//! Primary coordinator and worker loop

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    config::ChatConfig,
    generation::{Discard, GenerationLoop, GenerationOutcome},
    relay::{relay, CloseReason, RelayEvent},
    session::{validate_history, window, PromptTemplate, Turn},
    sync::{validate_sampling, PayloadTruncation, Request, RequestSynchronizer},
    CoreError, Result,
};

/// Per-request sampling settings chosen by the caller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_length: usize,
}

impl SamplingParams {
    pub fn from_config(chat: &ChatConfig) -> Self {
        Self {
            temperature: chat.temperature,
            top_p: chat.top_p,
            max_output_length: chat.max_output_length,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_sampling(self.temperature, self.top_p, self.max_output_length)
    }
}

/// One snapshot of the conversation while a reply streams in
#[derive(Debug, Clone, PartialEq)]
pub struct ChatUpdate {
    /// Windowed history with the pending reply set to the latest partial text
    pub transcript: Vec<Turn>,
    /// Present when the prompt was cut to fit the transport buffer
    pub truncated: Option<PayloadTruncation>,
    /// Set on the last update only
    pub finished: Option<CloseReason>,
}

impl ChatUpdate {
    /// Text of the reply being generated
    pub fn reply(&self) -> &str {
        self.transcript
            .last()
            .and_then(|turn| turn.assistant.as_deref())
            .unwrap_or("")
    }
}

/// Lazy, finite sequence of transcript snapshots
pub type ChatStream = BoxStream<'static, ChatUpdate>;

/// Entry point on rank 0: turns conversation history into streamed replies
pub struct Primary {
    synchronizer: Arc<RequestSynchronizer>,
    generator: Arc<GenerationLoop>,
    template: PromptTemplate,
    history_length: usize,
    in_flight: Arc<Mutex<()>>,
}

impl Primary {
    pub fn new(
        synchronizer: RequestSynchronizer,
        generator: GenerationLoop,
        template: PromptTemplate,
        history_length: usize,
    ) -> Self {
        Self {
            synchronizer: Arc::new(synchronizer),
            generator: Arc::new(generator),
            template,
            history_length,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Run the startup handshake with every worker
    pub async fn start(&self, seed: u64, fingerprint: u64) -> Result<()> {
        self.synchronizer.handshake(seed, fingerprint).await
    }

    /// Generate the reply to the pending last turn of `history`.
    ///
    /// Returns once the request has been broadcast; the loop runs on a
    /// blocking thread and the stream yields one update per step plus a
    /// final one carrying the close reason. Requests are served one at a
    /// time: a second call waits until the previous loop has ended, even if
    /// its stream was dropped early.
    pub async fn generate(&self, history: Vec<Turn>, params: SamplingParams) -> Result<ChatStream> {
        validate_history(&history)?;
        params.validate()?;

        let transcript = window(&history, self.history_length).to_vec();
        let payload = self.template.render(&transcript);
        debug!(turns = transcript.len(), payload_len = payload.len(), "Rendered prompt");

        let guard = Arc::clone(&self.in_flight).lock_owned().await;

        let request = Request {
            payload,
            temperature: params.temperature,
            top_p: params.top_p,
            max_output_length: params.max_output_length,
            stop_marker: self.synchronizer.stop_marker().to_string(),
        };
        let synced = self.synchronizer.publish(request).await?;
        let truncated = synced.truncated;

        let (mut producer, consumer) = relay(
            Arc::clone(self.synchronizer.tokenizer()),
            self.synchronizer.stop_marker(),
        );
        let generator = Arc::clone(&self.generator);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            match generator.run(&synced, &mut producer) {
                Ok(outcome) => producer.close(CloseReason::Finished(outcome.finish_reason)),
                Err(e) => {
                    error!(code = e.code(), error = %e, "Request aborted");
                    producer.close(CloseReason::aborted(&e));
                }
            }
        });

        let updates = stream::unfold(
            Some((consumer, transcript)),
            move |state| async move {
                let (mut consumer, mut transcript) = state?;
                match consumer.next().await? {
                    RelayEvent::Partial(text) => {
                        if let Some(turn) = transcript.last_mut() {
                            turn.assistant = Some(text);
                        }
                        let update = ChatUpdate {
                            transcript: transcript.clone(),
                            truncated,
                            finished: None,
                        };
                        Some((update, Some((consumer, transcript))))
                    }
                    RelayEvent::Closed(reason) => {
                        if let Some(turn) = transcript.last_mut() {
                            turn.assistant.get_or_insert_with(String::new);
                        }
                        let update = ChatUpdate {
                            transcript,
                            truncated,
                            finished: Some(reason),
                        };
                        Some((update, None))
                    }
                }
            },
        );
        Ok(updates.boxed())
    }
}

/// Loop run by every rank other than the primary
pub struct Worker {
    synchronizer: RequestSynchronizer,
    generator: Arc<GenerationLoop>,
}

impl Worker {
    pub fn new(synchronizer: RequestSynchronizer, generator: GenerationLoop) -> Self {
        Self {
            synchronizer,
            generator: Arc::new(generator),
        }
    }

    /// Answer the primary's startup handshake
    pub async fn start(&self, seed: u64, fingerprint: u64) -> Result<()> {
        self.synchronizer.handshake(seed, fingerprint).await
    }

    /// Wait for one request and run it with the output discarded
    pub async fn serve_one(&self) -> Result<GenerationOutcome> {
        let synced = self.synchronizer.await_request().await?;
        let generator = Arc::clone(&self.generator);
        tokio::task::spawn_blocking(move || generator.run(&synced, &mut Discard))
            .await
            .map_err(|e| CoreError::Internal {
                code: "WORKER_JOIN",
                message: e.to_string(),
                context: "Joining the generation thread".to_string(),
                source: None,
            })?
    }

    /// Serve requests until the primary goes away.
    ///
    /// Request-scoped failures are logged and the worker waits for the next
    /// request. Returns the number of requests completed.
    pub async fn serve(&self) -> Result<usize> {
        let rank = self.synchronizer.channel().rank();
        info!(rank, "Worker ready");
        let mut served = 0;
        loop {
            match self.serve_one().await {
                Ok(outcome) => {
                    served += 1;
                    debug!(rank, served, finish_reason = %outcome.finish_reason, "Request complete");
                }
                Err(e) if e.is_transport_closed() => {
                    info!(rank, served, "Primary disconnected; worker stopping");
                    return Ok(served);
                }
                Err(e) if e.is_request_scoped() => {
                    warn!(rank, code = e.code(), error = %e, "Request aborted; awaiting the next one");
                }
                Err(e) => {
                    error!(rank, code = e.code(), error = %e, "Worker failed");
                    return Err(e);
                }
            }
        }
    }
}
