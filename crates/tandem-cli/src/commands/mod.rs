//! Command implementations for the Tandem CLI

pub mod info;
pub mod init;
pub mod serve;

use anyhow::Result;
use async_trait::async_trait;
use tandem_core::config::TandemConfig;

/// Trait for CLI command execution
#[async_trait]
pub trait Command: Send + Sync {
    /// Whether the configuration file must be loaded before running
    fn needs_config(&self) -> bool {
        true
    }

    /// Layer command-line settings over the loaded configuration
    fn apply_overrides(&self, _config: &mut TandemConfig) {}

    /// Execute the command
    async fn execute(&self, config: &TandemConfig, json_output: bool) -> Result<()>;
}
