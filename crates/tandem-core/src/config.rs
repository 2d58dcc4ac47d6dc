//! Configuration for a shard pool process

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::{CoreError, Result};

/// Preamble used when neither `chat.preamble` nor `chat.preamble_file` is set
pub const DEFAULT_PREAMBLE: &str = "Consider an AI assistant whose codename is Dromedary, developed by the Self-Align team. Dromedary is trained on data up until Sept-2021, and it endeavors to be a helpful, ethical and reliable assistant.";

/// Main configuration shared by every rank of the pool
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TandemConfig {
    /// Checkpoint and tokenizer locations plus model limits
    pub model: ModelConfig,

    /// Process-group layout
    pub cluster: ClusterConfig,

    /// Request dissemination settings
    pub sync: SyncConfig,

    /// Conversation rendering and default sampling
    pub chat: ChatConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory holding one shard file per rank
    pub checkpoint_dir: PathBuf,

    /// Tokenizer definition file
    pub tokenizer_path: PathBuf,

    /// File extension of shard files inside `checkpoint_dir`
    pub shard_extension: String,

    /// Maximum sequence length (prompt plus generated tokens)
    pub max_seq_len: usize,

    /// Maximum batch size the model is built for
    pub max_batch_size: usize,

    /// Maximum length of the shared prompt prefix
    pub max_shared_seq_len: usize,

    /// Seed applied identically on every rank before the first request
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            tokenizer_path: PathBuf::from("tokenizer.json"),
            shard_extension: "gguf".to_string(),
            max_seq_len: 512,
            max_batch_size: 32,
            max_shared_seq_len: 512,
            seed: 1,
        }
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of ranks in the pool
    pub world_size: usize,

    /// This process's rank; rank 0 is the primary
    pub rank: usize,

    /// Address the primary listens on and workers dial
    pub primary_addr: String,

    /// How long workers keep retrying the initial connection
    pub connect_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            primary_addr: "127.0.0.1:29500".to_string(),
            connect_timeout_ms: 60_000,
        }
    }
}

/// What to do with a payload that does not fit the transport buffer
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Keep the first `payload_capacity` units and report the truncation
    #[default]
    Truncate,
    /// Fail the request before anything is sent
    Reject,
}

/// Synchronisation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Capacity of the fixed-size payload buffer, in encoded units
    pub payload_capacity: usize,

    /// Overflow handling for oversized payloads
    pub overflow: OverflowPolicy,

    /// Upper bound for a single synchronisation step; absent waits forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            payload_capacity: 4096,
            overflow: OverflowPolicy::Truncate,
            timeout_ms: None,
        }
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }
}

/// Chat configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    /// Number of user/assistant pairs kept in the rendered prompt
    pub history_length: usize,

    /// System preamble placed before the conversation
    pub preamble: String,

    /// File whose trimmed contents replace `preamble`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preamble_file: Option<PathBuf>,

    /// Tag introducing user turns
    pub user_tag: String,

    /// Tag introducing assistant turns
    pub assistant_tag: String,

    /// Literal whose appearance in the output ends generation
    pub stop_marker: String,

    /// Default sampling temperature
    pub temperature: f32,

    /// Default nucleus sampling threshold
    pub top_p: f32,

    /// Default bound on generated tokens
    pub max_output_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_length: 10,
            preamble: DEFAULT_PREAMBLE.to_string(),
            preamble_file: None,
            user_tag: "### User".to_string(),
            assistant_tag: "### Dromedary".to_string(),
            stop_marker: "### User".to_string(),
            temperature: 0.5,
            top_p: 0.9,
            max_output_length: 384,
        }
    }
}

impl ChatConfig {
    /// Preamble text, read from `preamble_file` when one is configured
    pub fn resolve_preamble(&self) -> Result<String> {
        match &self.preamble_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| CoreError::Io {
                    code: "CONFIG_PREAMBLE_READ",
                    message: e.to_string(),
                    path: Some(path.clone()),
                    suggestion: "Check chat.preamble_file points at a readable text file".to_string(),
                    source: e,
                })?;
                Ok(text.trim().to_string())
            }
            None => Ok(self.preamble.clone()),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level used when neither flags nor RUST_LOG choose one
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl TandemConfig {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::Io {
            code: "CONFIG_READ",
            message: e.to_string(),
            path: Some(path.to_path_buf()),
            suggestion: "Check that the configuration file exists and is readable".to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| CoreError::Configuration {
            code: "CONFIG_PARSE",
            message: e.to_string(),
            context: "Parsing TOML configuration".to_string(),
            suggestion: "Fix the syntax error reported above".to_string(),
            config_path: Some(path.to_path_buf()),
            field_name: None,
        })
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| CoreError::Internal {
            code: "CONFIG_SERIALIZE",
            message: e.to_string(),
            context: "Serialising configuration".to_string(),
            source: None,
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let cluster = &self.cluster;
        if cluster.world_size == 0 {
            return Err(CoreError::configuration_field(
                "CONFIG_WORLD_SIZE",
                "world_size must be greater than 0",
                "Cluster configuration validation",
                "Set cluster.world_size to the number of shard processes",
                "cluster.world_size",
            ));
        }
        if cluster.rank >= cluster.world_size {
            return Err(CoreError::configuration_field(
                "CONFIG_RANK",
                format!("rank {} is outside a pool of {}", cluster.rank, cluster.world_size),
                "Cluster configuration validation",
                "Use a rank in 0..world_size",
                "cluster.rank",
            ));
        }

        let model = &self.model;
        if model.max_seq_len == 0 {
            return Err(CoreError::configuration_field(
                "CONFIG_MAX_SEQ_LEN",
                "max_seq_len must be greater than 0",
                "Model configuration validation",
                "Set model.max_seq_len to the context size of the checkpoint",
                "model.max_seq_len",
            ));
        }
        if model.max_batch_size == 0 {
            return Err(CoreError::configuration_field(
                "CONFIG_MAX_BATCH_SIZE",
                "max_batch_size must be greater than 0",
                "Model configuration validation",
                "Set model.max_batch_size to at least 1",
                "model.max_batch_size",
            ));
        }
        if model.max_shared_seq_len > model.max_seq_len {
            return Err(CoreError::configuration_field(
                "CONFIG_MAX_SHARED_SEQ_LEN",
                format!(
                    "max_shared_seq_len {} exceeds max_seq_len {}",
                    model.max_shared_seq_len, model.max_seq_len
                ),
                "Model configuration validation",
                "Lower model.max_shared_seq_len",
                "model.max_shared_seq_len",
            ));
        }

        if self.sync.payload_capacity == 0 {
            return Err(CoreError::configuration_field(
                "CONFIG_PAYLOAD_CAPACITY",
                "payload_capacity must be greater than 0",
                "Synchronisation configuration validation",
                "Set sync.payload_capacity, e.g. 4096",
                "sync.payload_capacity",
            ));
        }

        let chat = &self.chat;
        if chat.history_length == 0 {
            return Err(CoreError::configuration_field(
                "CONFIG_HISTORY_LENGTH",
                "history_length must be greater than 0",
                "Chat configuration validation",
                "Set chat.history_length to at least 1",
                "chat.history_length",
            ));
        }
        if chat.assistant_tag.is_empty() {
            return Err(CoreError::configuration_field(
                "CONFIG_ASSISTANT_TAG",
                "assistant_tag must not be empty",
                "Chat configuration validation",
                "Set chat.assistant_tag, e.g. \"### Dromedary\"",
                "chat.assistant_tag",
            ));
        }
        if !(0.0..=2.0).contains(&chat.temperature) {
            return Err(CoreError::configuration_field(
                "CONFIG_TEMPERATURE",
                format!("temperature {} is out of range", chat.temperature),
                "Chat configuration validation",
                "Use a temperature between 0.0 and 2.0",
                "chat.temperature",
            ));
        }
        if !(chat.top_p > 0.0 && chat.top_p <= 1.0) {
            return Err(CoreError::configuration_field(
                "CONFIG_TOP_P",
                format!("top_p {} is out of range", chat.top_p),
                "Chat configuration validation",
                "Use a top_p in (0.0, 1.0]",
                "chat.top_p",
            ));
        }
        if chat.max_output_length == 0 {
            return Err(CoreError::configuration_field(
                "CONFIG_MAX_OUTPUT_LENGTH",
                "max_output_length must be greater than 0",
                "Chat configuration validation",
                "Set chat.max_output_length to at least 1",
                "chat.max_output_length",
            ));
        }

        Ok(())
    }

    /// Digest of the settings every rank must agree on before serving.
    ///
    /// Covers the stop marker, the role tags and the preamble; the numeric
    /// settings travel in the handshake as-is.
    pub fn fingerprint(&self, preamble: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(b"tandem-chat-v1");
        for part in [
            self.chat.stop_marker.as_str(),
            self.chat.user_tag.as_str(),
            self.chat.assistant_tag.as_str(),
            preamble,
        ] {
            // length prefix so ("ab", "c") and ("a", "bc") differ
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(head)
    }
}
