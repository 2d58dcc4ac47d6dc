//! Tandem Core - lockstep generation across a pool of model shards
//!
//! This crate provides the coordination layer for a fixed pool of processes
//! that jointly hold the shards of a generative model: the primary
//! disseminates each request through ordered collective broadcasts, every
//! rank runs the same token-by-token loop, and the primary streams partial
//! output to a single consumer.

// Module declarations
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod generation;
pub mod model;
pub mod relay;
pub mod runtime;
pub mod session;
pub mod shard;
pub mod sync;
pub mod tokenizer;
pub mod transport;

#[doc(hidden)]
pub mod test_support;

use std::time::Duration;

use thiserror::Error;

use crate::broadcast::SyncStep;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Startup configuration errors; fatal for the process
    #[error("Configuration error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Configuration {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        config_path: Option<std::path::PathBuf>,
        field_name: Option<String>,
    },

    /// A synchronisation step exceeded the configured bound
    #[error("Synchronisation timeout [SYNC_TIMEOUT]: step '{step}' did not complete within {waited:?}")]
    SyncTimeout { step: SyncStep, waited: Duration },

    /// A peer delivered something other than what this step declared
    #[error("Synchronisation diverged [SYNC_DESYNC]: {} expected {expected}, found {found}", describe_step(.step))]
    Desync {
        step: Option<SyncStep>,
        expected: String,
        found: String,
    },

    /// The encoded payload does not fit the transport buffer
    #[error("Payload truncated [PAYLOAD_TRUNCATED]: {encoded_len} encoded units exceed capacity {capacity}")]
    PayloadTruncated { encoded_len: usize, capacity: usize },

    /// Generation loop errors; abort only the current request
    #[error("Generation error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Generation {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        step: Option<usize>,
    },

    /// Transport and connection errors
    #[error("Transport error [{code}]: {message}\nContext: {context}")]
    Transport {
        code: &'static str,
        message: String,
        context: String,
        peer: Option<usize>,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Tokenizer initialization or operation errors
    #[error("Tokenizer error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Tokenizer {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
    },

    /// Input validation and parameter errors
    #[error("Invalid input [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    InvalidInput {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        parameter_name: Option<String>,
        value: Option<String>,
        valid_range: Option<String>,
    },

    /// File system and I/O errors
    #[error("IO error [{code}]: {message}\nPath: {path:?}\nSuggestion: {suggestion}")]
    Io {
        code: &'static str,
        message: String,
        path: Option<std::path::PathBuf>,
        suggestion: String,
        #[source]
        source: std::io::Error,
    },

    /// Other unexpected errors
    #[error("Internal error [{code}]: {message}\nContext: {context}")]
    Internal {
        code: &'static str,
        message: String,
        context: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a configuration error
    pub fn configuration<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            config_path: None,
            field_name: None,
        }
    }

    /// Create a configuration error pointing at a specific field
    pub fn configuration_field<S1, S2, S3, S4>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
        field_name: S4,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            config_path: None,
            field_name: Some(field_name.into()),
        }
    }

    /// Create a generation error
    pub fn generation<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Generation {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            step: None,
        }
    }

    /// Create a transport error
    pub fn transport<S1, S2>(code: &'static str, message: S1, context: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Transport {
            code,
            message: message.into(),
            context: context.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a transport error caused by an I/O failure talking to `peer`
    pub fn transport_io<S>(code: &'static str, context: S, peer: usize, source: std::io::Error) -> Self
    where
        S: Into<String>,
    {
        Self::Transport {
            code,
            message: source.to_string(),
            context: context.into(),
            peer: Some(peer),
            source: Some(source),
        }
    }

    /// Create a tokenizer error
    pub fn tokenizer<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Tokenizer {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an invalid input error with parameter validation details
    pub fn invalid_parameter<S1, S2, S3, S4, S5, S6>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
        param_name: S4,
        value: S5,
        valid_range: S6,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
        S5: Into<String>,
        S6: Into<String>,
    {
        Self::InvalidInput {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            parameter_name: Some(param_name.into()),
            value: Some(value.into()),
            valid_range: Some(valid_range.into()),
        }
    }

    /// Create an invalid input error without parameter details
    pub fn invalid_input<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::InvalidInput {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            parameter_name: None,
            value: None,
            valid_range: None,
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { code, .. } => code,
            Self::SyncTimeout { .. } => "SYNC_TIMEOUT",
            Self::Desync { .. } => "SYNC_DESYNC",
            Self::PayloadTruncated { .. } => "PAYLOAD_TRUNCATED",
            Self::Generation { code, .. } => code,
            Self::Transport { code, .. } => code,
            Self::Tokenizer { code, .. } => code,
            Self::InvalidInput { code, .. } => code,
            Self::Io { code, .. } => code,
            Self::Internal { code, .. } => code,
        }
    }

    /// Whether this failure aborts only the current request, leaving the
    /// pool ready for the next broadcast cycle.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            Self::SyncTimeout { .. }
                | Self::PayloadTruncated { .. }
                | Self::Generation { .. }
                | Self::InvalidInput { .. }
                | Self::Tokenizer { .. }
        )
    }

    /// Whether the peer side of the transport went away cleanly.
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, Self::Transport { code: "TRANSPORT_CLOSED", .. })
    }

    /// Attribute a frame-level divergence to the named step that hit it
    pub fn in_step(self, step: SyncStep) -> Self {
        match self {
            Self::Desync {
                step: None,
                expected,
                found,
            } => Self::Desync {
                step: Some(step),
                expected,
                found,
            },
            other => other,
        }
    }
}

fn describe_step(step: &Option<SyncStep>) -> String {
    match step {
        Some(step) => format!("step '{step}'"),
        None => "transport frame".to_string(),
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        let (code, suggestion) = match err.kind() {
            std::io::ErrorKind::NotFound => (
                "IO_FILE_NOT_FOUND",
                "Check that the file path is correct and the file exists",
            ),
            std::io::ErrorKind::PermissionDenied => (
                "IO_PERMISSION_DENIED",
                "Check file permissions or run with appropriate privileges",
            ),
            std::io::ErrorKind::InvalidData => (
                "IO_INVALID_DATA",
                "The file may be corrupted or in an unexpected format",
            ),
            _ => (
                "IO_UNKNOWN",
                "Check the file system and try the operation again",
            ),
        };

        Self::Io {
            code,
            message: err.to_string(),
            path: None,
            suggestion: suggestion.to_string(),
            source: err,
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            code: "INTERNAL_UNKNOWN",
            message: err.to_string(),
            context: "An unexpected error occurred".to_string(),
            source: Some(err),
        }
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        broadcast::{BroadcastChannel, SyncStep},
        config::{ChatConfig, ClusterConfig, ModelConfig, OverflowPolicy, SyncConfig, TandemConfig},
        engine::{ChatStream, ChatUpdate, Primary, SamplingParams, Worker},
        generation::{FinishReason, GenerationOutcome, GenerationState, PartialOutput, StepSink},
        model::{Model, ModelLoader, SharedModel, StepOutput},
        relay::{relay, CloseReason, RelayConsumer, RelayEvent, RelayProducer},
        runtime::ProcessContext,
        session::{ChatSession, Turn},
        shard::ShardManifest,
        sync::{PayloadTruncation, Request, RequestSynchronizer, SyncedRequest},
        tokenizer::Tokenizer,
        transport::{Buffer, DType, Rank, Shape, Transport, PRIMARY_RANK},
        CoreError, Result,
    };
}

// Re-export key types at the crate root
pub use config::TandemConfig;
pub use engine::{Primary, Worker};
pub use session::ChatSession;

pub mod error {
    pub use super::{CoreError, Result};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = CoreError::configuration(
            "CONFIG_WORLD_SIZE",
            "world_size must be greater than 0",
            "Cluster configuration validation",
            "Set cluster.world_size to the number of shard processes",
        );
        assert_eq!(err.code(), "CONFIG_WORLD_SIZE");
        assert!(!err.is_request_scoped());

        let err = CoreError::SyncTimeout {
            step: SyncStep::Payload,
            waited: Duration::from_millis(250),
        };
        assert_eq!(err.code(), "SYNC_TIMEOUT");
        assert!(err.is_request_scoped());
        assert!(err.to_string().contains("payload"));
    }

    #[test]
    fn test_transport_closed_detection() {
        let err = CoreError::transport("TRANSPORT_CLOSED", "peer hung up", "awaiting wake signal");
        assert!(err.is_transport_closed());
        assert!(!err.is_request_scoped());

        let err = CoreError::transport("TRANSPORT_ROUTE", "no route", "send");
        assert!(!err.is_transport_closed());
    }

    #[test]
    fn test_desync_attributed_to_step() {
        let err = CoreError::Desync {
            step: None,
            expected: "broadcast int64[4]".to_string(),
            found: "broadcast int64[1]".to_string(),
        };
        assert!(err.to_string().contains("transport frame"));

        let err = err.in_step(SyncStep::Payload);
        assert_eq!(err.code(), "SYNC_DESYNC");
        assert!(err.to_string().contains("step 'payload'"));
        assert!(!err.is_request_scoped());
    }
}
