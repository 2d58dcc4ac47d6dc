//! Token-by-token generation loop run identically on every rank

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

use crate::{
    generation::{FinishReason, GenerationOutcome, GenerationState, PartialOutput, StepSink},
    model::SharedModel,
    sync::SyncedRequest,
    tokenizer::Tokenizer,
    CoreError, Result,
};

/// Extra tokens decoded beyond the marker length when looking for it
const STOP_WINDOW_SLACK: usize = 8;

/// Runs the shared model until a stop condition fires.
///
/// Only the broadcast request and the model feed the loop, so every rank
/// takes the same number of steps and emits the same tokens.
pub struct GenerationLoop {
    model: SharedModel,
    tokenizer: Arc<dyn Tokenizer>,
    max_seq_len: usize,
}

impl GenerationLoop {
    pub fn new(model: SharedModel, tokenizer: Arc<dyn Tokenizer>, max_seq_len: usize) -> Self {
        Self {
            model,
            tokenizer,
            max_seq_len,
        }
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Effective output bound: the requested length, capped by the context
    pub fn output_bound(&self, prompt_len: usize, max_output_length: usize) -> Result<usize> {
        if prompt_len >= self.max_seq_len {
            return Err(CoreError::generation(
                "GENERATION_CONTEXT_FULL",
                format!(
                    "prompt of {prompt_len} tokens leaves no room in a context of {}",
                    self.max_seq_len
                ),
                "Computing the output bound",
                "Shorten the conversation or lower chat.history_length",
            ));
        }
        Ok(max_output_length.min(self.max_seq_len - prompt_len))
    }

    /// Run one request to completion.
    ///
    /// After every step the full generated sequence is pushed to `sink`. Stop
    /// conditions are checked in priority order: output bound, stop marker in
    /// the decoded tail, end of sequence. A failing step aborts the request;
    /// it is never retried because the ranks would diverge.
    pub fn run(&self, synced: &SyncedRequest, sink: &mut dyn StepSink) -> Result<GenerationOutcome> {
        let started = Instant::now();
        let request = &synced.request;

        if synced.prompt_tokens.is_empty() {
            return Err(CoreError::generation(
                "GENERATION_EMPTY_PROMPT",
                "the broadcast prompt holds no tokens",
                "Starting generation",
                "Send a non-empty payload",
            ));
        }
        let bound = self.output_bound(synced.prompt_tokens.len(), request.max_output_length)?;
        let stop_marker = request.stop_marker.as_str();
        let window = stop_marker.len() + STOP_WINDOW_SLACK;
        let eos = self.tokenizer.eos_token_id();

        debug!(
            prompt_tokens = synced.prompt_tokens.len(),
            bound,
            temperature = request.temperature,
            top_p = request.top_p,
            "Starting generation loop"
        );

        let mut state = GenerationState::from_request(synced);
        let mut model = self.model.lock();
        let mut steps = 0;

        let finish_reason = loop {
            let output = model
                .step(&state)
                .map_err(|e| step_failure(e, steps))?;
            steps += 1;

            let end_of_sequence = output.end_of_sequence || Some(output.token) == eos;
            if !end_of_sequence {
                state.generated.push(output.token);
            }
            trace!(step = steps, token = output.token, end_of_sequence, "generation step");

            sink.push(PartialOutput {
                step: steps,
                tokens: state.generated.clone(),
            });

            if state.generated.len() >= bound {
                break FinishReason::MaxLength;
            }
            if !stop_marker.is_empty() {
                let tail_start = state.generated.len().saturating_sub(window);
                let tail = self.tokenizer.decode(&state.generated[tail_start..])?;
                if tail.contains(stop_marker) {
                    break FinishReason::StopMarker;
                }
            }
            if end_of_sequence {
                break FinishReason::EndOfSequence;
            }
        };

        let outcome = GenerationOutcome {
            tokens: state.generated,
            finish_reason,
            steps,
            elapsed: started.elapsed(),
        };
        info!(
            tokens = outcome.tokens.len(),
            steps = outcome.steps,
            finish_reason = %outcome.finish_reason,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            tokens_per_second = outcome.tokens_per_second(),
            "Generation finished"
        );
        Ok(outcome)
    }
}

fn step_failure(err: CoreError, step: usize) -> CoreError {
    match err {
        CoreError::Generation {
            code,
            message,
            context,
            suggestion,
            ..
        } => CoreError::Generation {
            code,
            message,
            context,
            suggestion,
            step: Some(step),
        },
        other => CoreError::Generation {
            code: "MODEL_STEP_FAILED",
            message: other.to_string(),
            context: format!("generation step {step}"),
            suggestion: "The request was aborted; the pool accepts the next one".to_string(),
            step: Some(step),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Discard;
    use crate::model;
    use crate::sync::Request;
    use crate::test_support::{CharTokenizer, ScriptedModel, BOS};

    fn looped(model: ScriptedModel, max_seq_len: usize) -> GenerationLoop {
        GenerationLoop::new(model::shared(Box::new(model)), Arc::new(CharTokenizer), max_seq_len)
    }

    fn synced(prompt: &str, max_output_length: usize) -> SyncedRequest {
        let mut prompt_tokens = vec![BOS];
        prompt_tokens.extend(prompt.chars().map(u32::from));
        SyncedRequest {
            sequence: 1,
            request: Request {
                payload: prompt.to_string(),
                temperature: 0.0,
                top_p: 1.0,
                max_output_length,
                stop_marker: "### User".to_string(),
            },
            prompt_tokens,
            truncated: None,
        }
    }

    fn text(tokens: &[u32]) -> String {
        CharTokenizer.decode(tokens).unwrap()
    }

    #[test]
    fn test_stops_at_max_length() {
        let generator = looped(ScriptedModel::new("Llamas are camelids."), 512);
        let mut units: Vec<PartialOutput> = Vec::new();
        let outcome = generator.run(&synced("hi", 5), &mut units).unwrap();

        assert_eq!(outcome.finish_reason, FinishReason::MaxLength);
        assert_eq!(text(&outcome.tokens), "Llama");
        assert_eq!(outcome.steps, 5);
        assert_eq!(units.len(), 5);
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(unit.step, i + 1);
            assert_eq!(unit.tokens.len(), i + 1);
        }
    }

    #[test]
    fn test_stop_marker_takes_priority_over_eos() {
        let generator = looped(ScriptedModel::new("Sure.\n\n### User"), 512);
        let mut units: Vec<PartialOutput> = Vec::new();
        let outcome = generator.run(&synced("hi", 100), &mut units).unwrap();

        assert_eq!(outcome.finish_reason, FinishReason::StopMarker);
        assert!(text(&outcome.tokens).ends_with("### User"));
        assert_eq!(units.last().unwrap().tokens, outcome.tokens);
    }

    #[test]
    fn test_end_of_sequence() {
        let generator = looped(ScriptedModel::new("Yes."), 512);
        let mut units: Vec<PartialOutput> = Vec::new();
        let outcome = generator.run(&synced("hi", 100), &mut units).unwrap();

        assert_eq!(outcome.finish_reason, FinishReason::EndOfSequence);
        assert_eq!(text(&outcome.tokens), "Yes.");
        // four tokens plus the end-of-sequence step
        assert_eq!(outcome.steps, 5);
        assert_eq!(units.len(), 5);
    }

    #[test]
    fn test_context_caps_the_bound() {
        // BOS + "hi" leaves two slots in a context of five
        let generator = looped(ScriptedModel::new("abcdef"), 5);
        let outcome = generator.run(&synced("hi", 100), &mut Discard).unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::MaxLength);
        assert_eq!(outcome.tokens.len(), 2);

        let generator = looped(ScriptedModel::new("abcdef"), 3);
        let err = generator.run(&synced("hi", 100), &mut Discard).unwrap_err();
        assert_eq!(err.code(), "GENERATION_CONTEXT_FULL");
    }

    #[test]
    fn test_step_failure_aborts_request() {
        let generator = looped(ScriptedModel::new("abcdef").failing_at(1, 2), 512);
        let mut units: Vec<PartialOutput> = Vec::new();
        let err = generator.run(&synced("hi", 100), &mut units).unwrap_err();

        assert_eq!(err.code(), "MODEL_STEP_FAILED");
        assert!(err.is_request_scoped());
        match err {
            CoreError::Generation { step, .. } => assert_eq!(step, Some(2)),
            other => panic!("unexpected error: {other}"),
        }
        // units from completed steps were already handed off
        assert_eq!(units.len(), 2);
    }
}
