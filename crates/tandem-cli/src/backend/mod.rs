//! Concrete tokenizer and model bindings

#[cfg(feature = "candle")]
pub mod candle;
pub mod hf_tokenizer;

pub use hf_tokenizer::HfTokenizer;

use anyhow::Result;
use tandem_core::model::ModelLoader;

/// Loader for the model backend this binary was built with
#[cfg(feature = "candle")]
pub fn model_loader() -> Result<Box<dyn ModelLoader + Send>> {
    Ok(Box::new(candle::GgufLoader::cpu()))
}

#[cfg(not(feature = "candle"))]
pub fn model_loader() -> Result<Box<dyn ModelLoader + Send>> {
    anyhow::bail!("this binary was built without a model backend; rebuild with the `candle` feature")
}
