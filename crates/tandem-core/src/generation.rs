//! Generation state, outcomes and the per-step output sink

pub mod lockstep;

pub use lockstep::GenerationLoop;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::sync::SyncedRequest;

/// Everything a model step may look at.
///
/// Derived only from the broadcast request, so it is identical on every rank.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationState {
    pub prompt_tokens: Vec<u32>,
    pub generated: Vec<u32>,
    pub temperature: f32,
    pub top_p: f32,
}

impl GenerationState {
    pub fn from_request(synced: &SyncedRequest) -> Self {
        Self {
            prompt_tokens: synced.prompt_tokens.clone(),
            generated: Vec::new(),
            temperature: synced.request.temperature,
            top_p: synced.request.top_p,
        }
    }

    /// Number of tokens in the running sequence
    pub fn position(&self) -> usize {
        self.prompt_tokens.len() + self.generated.len()
    }

    /// The most recent token, from the prompt if nothing was generated yet
    pub fn last_token(&self) -> Option<u32> {
        self.generated
            .last()
            .or_else(|| self.prompt_tokens.last())
            .copied()
    }
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Reached the output length bound
    MaxLength,

    /// Decoded output contains the stop marker
    StopMarker,

    /// End of sequence signalled by the model
    EndOfSequence,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::MaxLength => write!(f, "max_length"),
            FinishReason::StopMarker => write!(f, "stop_marker"),
            FinishReason::EndOfSequence => write!(f, "end_of_sequence"),
        }
    }
}

/// Result of one completed generation loop
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    /// Generated tokens, excluding the prompt
    pub tokens: Vec<u32>,

    /// Reason generation stopped
    pub finish_reason: FinishReason,

    /// Number of model steps taken
    pub steps: usize,

    /// Wall time spent in the loop
    pub elapsed: Duration,
}

impl GenerationOutcome {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.tokens.len() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Tokens emitted so far, pushed once per step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialOutput {
    pub step: usize,
    pub tokens: Vec<u32>,
}

/// Receives the loop's partial output after every step
pub trait StepSink {
    fn push(&mut self, unit: PartialOutput);
}

/// Sink for ranks whose output nobody reads
pub struct Discard;

impl StepSink for Discard {
    fn push(&mut self, _unit: PartialOutput) {}
}

impl StepSink for Vec<PartialOutput> {
    fn push(&mut self, unit: PartialOutput) {
        Vec::push(self, unit);
    }
}
