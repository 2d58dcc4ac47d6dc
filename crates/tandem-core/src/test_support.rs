//! Deterministic collaborators for tests
//!
//! Shared by the unit tests and the integration tests under `tests/`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::generation::GenerationState;
use crate::model::{Model, StepOutput};
use crate::tokenizer::Tokenizer;
use crate::transport::{Buffer, Rank, Transport};
use crate::{CoreError, Result};

pub const BOS: u32 = 0x11_0000;
pub const EOS: u32 = 0x11_0001;

/// One token per Unicode scalar value
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = Vec::with_capacity(text.len() + 1);
        if add_bos {
            ids.push(BOS);
        }
        ids.extend(text.chars().map(u32::from));
        Ok(ids)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        Ok(tokens.iter().filter_map(|id| char::from_u32(*id)).collect())
    }

    fn vocab_size(&self) -> usize {
        EOS as usize + 1
    }

    fn bos_token_id(&self) -> Option<u32> {
        Some(BOS)
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS)
    }
}

/// Replies with a fixed script, one character per step, then end of
/// sequence. Optionally fails at one `(request, step)`, counting requests
/// from 1.
pub struct ScriptedModel {
    reply: Vec<u32>,
    fail_at: Option<(usize, usize)>,
    requests: usize,
    prompts: Option<Arc<Mutex<Vec<Vec<u32>>>>>,
}

impl ScriptedModel {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.chars().map(u32::from).collect(),
            fail_at: None,
            requests: 0,
            prompts: None,
        }
    }

    pub fn failing_at(mut self, request: usize, step: usize) -> Self {
        self.fail_at = Some((request, step));
        self
    }

    /// Record the prompt of every request this model serves
    pub fn recording(mut self, prompts: Arc<Mutex<Vec<Vec<u32>>>>) -> Self {
        self.prompts = Some(prompts);
        self
    }
}

impl Model for ScriptedModel {
    fn step(&mut self, state: &GenerationState) -> Result<StepOutput> {
        let step = state.generated.len();
        if step == 0 {
            self.requests += 1;
            if let Some(prompts) = &self.prompts {
                prompts.lock().push(state.prompt_tokens.clone());
            }
        }
        if self.fail_at == Some((self.requests, step)) {
            return Err(CoreError::Internal {
                code: "TEST_MODEL_FAILURE",
                message: format!("scripted failure at step {step}"),
                context: "ScriptedModel".to_string(),
                source: None,
            });
        }
        Ok(match self.reply.get(step) {
            Some(token) => StepOutput {
                token: *token,
                end_of_sequence: false,
            },
            None => StepOutput {
                token: EOS,
                end_of_sequence: true,
            },
        })
    }
}

/// Wraps a transport and holds back the next broadcast once armed
pub struct StallingTransport<T> {
    inner: T,
    stall: Mutex<Option<Duration>>,
}

impl<T> StallingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            stall: Mutex::new(None),
        }
    }

    pub fn stall_next_broadcast(&self, delay: Duration) {
        *self.stall.lock() = Some(delay);
    }
}

#[async_trait]
impl<T: Transport> Transport for StallingTransport<T> {
    fn rank(&self) -> Rank {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    async fn broadcast(&self, buf: &mut Buffer, root: Rank) -> Result<()> {
        let stall = self.stall.lock().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        self.inner.broadcast(buf, root).await
    }

    async fn send(&self, buf: &Buffer, dst: Rank) -> Result<()> {
        self.inner.send(buf, dst).await
    }

    async fn recv(&self, buf: &mut Buffer, src: Rank) -> Result<()> {
        self.inner.recv(buf, src).await
    }
}
