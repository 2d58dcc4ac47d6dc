//! Tokenizer collaborator interface
//!
//! The coordination layer only needs to turn the rendered conversation into
//! token ids on the primary and to decode token sequences for display and
//! stop-marker detection. Implementations live with the model bindings.

use crate::Result;

/// Text to token-id conversion used by the synchronizer and the relay.
///
/// Calls are synchronous: both users run on a blocking generation thread
/// or on the primary between broadcast steps.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids, optionally prefixed with the begin marker
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>>;

    /// Decode token ids back into text, skipping special tokens
    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// Get the vocabulary size
    fn vocab_size(&self) -> usize;

    /// Get the beginning of sequence token ID
    fn bos_token_id(&self) -> Option<u32>;

    /// Get the end of sequence token ID
    fn eos_token_id(&self) -> Option<u32>;
}
