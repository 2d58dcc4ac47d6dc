//! Model collaborator interface

use parking_lot::Mutex;
use std::sync::Arc;

use crate::{config::ModelConfig, generation::GenerationState, shard::ShardManifest, Result};

/// Result of one generation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutput {
    /// Next token id chosen by the model's sampler
    pub token: u32,
    /// Model-defined end-of-sequence signal
    pub end_of_sequence: bool,
}

/// One process's shard of the generative model.
///
/// `step` must be a pure function of the state and the weights, plus any
/// randomness seeded identically on every rank; otherwise the ranks diverge.
/// Implementations may keep incremental caches keyed on the state, and must
/// reset them when a new request starts (`state.generated` is empty).
pub trait Model: Send {
    /// Produce the next token for the running sequence
    fn step(&mut self, state: &GenerationState) -> Result<StepOutput>;

    /// Get the model name
    fn name(&self) -> &str {
        "model"
    }
}

/// Model shared by every request served on this process
pub type SharedModel = Arc<Mutex<Box<dyn Model>>>;

/// Wrap a loaded model for use by the generation loop
pub fn shared(model: Box<dyn Model>) -> SharedModel {
    Arc::new(Mutex::new(model))
}

/// Loads this process's shard of the model
pub trait ModelLoader {
    fn load_sharded(
        &self,
        manifest: &ShardManifest,
        shard_index: usize,
        shard_count: usize,
        config: &ModelConfig,
    ) -> Result<Box<dyn Model>>;
}
