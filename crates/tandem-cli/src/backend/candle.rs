//! Quantized llama shards loaded from GGUF files with candle

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama::ModelWeights;
use std::fs::File;
use std::path::Path;
use tandem_core::{
    config::ModelConfig,
    generation::GenerationState,
    model::{Model, ModelLoader, StepOutput},
    shard::ShardManifest,
    CoreError, Result,
};
use tracing::{info, trace};

const EOS_METADATA_KEY: &str = "tokenizer.ggml.eos_token_id";

fn candle_error(code: &'static str, context: String) -> impl FnOnce(candle_core::Error) -> CoreError {
    move |e| CoreError::Internal {
        code,
        message: e.to_string(),
        context,
        source: Some(anyhow::Error::new(e)),
    }
}

pub struct GgufLoader {
    device: Device,
}

impl GgufLoader {
    pub fn cpu() -> Self {
        Self { device: Device::Cpu }
    }
}

impl ModelLoader for GgufLoader {
    fn load_sharded(
        &self,
        manifest: &ShardManifest,
        shard_index: usize,
        shard_count: usize,
        config: &ModelConfig,
    ) -> Result<Box<dyn Model>> {
        let path = manifest.shard_for(shard_index)?;
        let context = format!("Loading shard {}", path.display());
        let mut file = File::open(path).map_err(|e| CoreError::Io {
            code: "MODEL_OPEN",
            message: e.to_string(),
            path: Some(path.to_path_buf()),
            suggestion: "Check model.checkpoint_dir and file permissions".to_string(),
            source: e,
        })?;

        let content = gguf_file::Content::read(&mut file)
            .map_err(candle_error("MODEL_LOAD", context.clone()))?;
        let eos = content
            .metadata
            .get(EOS_METADATA_KEY)
            .and_then(|value| value.to_u32().ok());
        let weights = ModelWeights::from_gguf(content, &mut file, &self.device)
            .map_err(candle_error("MODEL_LOAD", context))?;

        info!(shard_index, shard_count, path = %path.display(), "Loaded model shard");
        Ok(Box::new(GgufModel {
            name: shard_name(path),
            weights,
            device: self.device.clone(),
            seed: config.seed,
            eos,
            sampler: None,
        }))
    }
}

fn shard_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "gguf".to_string())
}

/// One rank's llama weights plus the per-request sampler
pub struct GgufModel {
    name: String,
    weights: ModelWeights,
    device: Device,
    seed: u64,
    eos: Option<u32>,
    sampler: Option<LogitsProcessor>,
}

impl GgufModel {
    fn sampler_for(&self, state: &GenerationState) -> LogitsProcessor {
        let temperature = (state.temperature > 0.0).then_some(f64::from(state.temperature));
        let top_p = (state.top_p < 1.0).then_some(f64::from(state.top_p));
        LogitsProcessor::new(self.seed, temperature, top_p)
    }
}

impl Model for GgufModel {
    fn step(&mut self, state: &GenerationState) -> Result<StepOutput> {
        // A new request replays the whole prompt from position 0, which also
        // resets the KV cache; later steps feed only the newest token.
        let (input, position) = if state.generated.is_empty() {
            self.sampler = Some(self.sampler_for(state));
            (state.prompt_tokens.clone(), 0)
        } else {
            let last = state.last_token().unwrap_or_default();
            (vec![last], state.position() - 1)
        };

        let context = format!("Step at position {position}");
        let logits = Tensor::new(input.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .and_then(|t| self.weights.forward(&t, position))
            .and_then(|t| t.squeeze(0))
            .and_then(|t| t.to_dtype(DType::F32))
            .map_err(candle_error("MODEL_FORWARD", context.clone()))?;

        let seed = self.seed;
        let token = self
            .sampler
            .get_or_insert_with(|| LogitsProcessor::new(seed, None, None))
            .sample(&logits)
            .map_err(candle_error("MODEL_SAMPLE", context))?;

        trace!(position, token, "Sampled token");
        Ok(StepOutput {
            token,
            end_of_sequence: self.eos == Some(token),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
