//! Configuration loading and command-line overrides

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tandem_core::config::TandemConfig;

/// Settings that can be given per process on the command line or through
/// the environment, taking precedence over the configuration file
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Rank of this process; rank 0 is the primary
    #[arg(long, env = "TANDEM_RANK")]
    pub rank: Option<usize>,

    /// Number of processes in the pool
    #[arg(long, env = "TANDEM_WORLD_SIZE")]
    pub world_size: Option<usize>,

    /// Address the primary listens on and workers dial
    #[arg(long, env = "TANDEM_PRIMARY_ADDR")]
    pub primary_addr: Option<String>,

    /// Directory holding one shard file per rank
    #[arg(long, env = "TANDEM_CHECKPOINT_DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Tokenizer definition (tokenizer.json)
    #[arg(long, env = "TANDEM_TOKENIZER")]
    pub tokenizer: Option<PathBuf>,

    /// Shared sampling seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Capacity of the request payload buffer, in tokens
    #[arg(long)]
    pub payload_capacity: Option<usize>,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Nucleus sampling threshold
    #[arg(long)]
    pub top_p: Option<f32>,

    /// Maximum number of generated tokens per reply
    #[arg(long)]
    pub max_output_length: Option<usize>,
}

impl Overrides {
    pub fn apply(&self, config: &mut TandemConfig) {
        if let Some(rank) = self.rank {
            config.cluster.rank = rank;
        }
        if let Some(world_size) = self.world_size {
            config.cluster.world_size = world_size;
        }
        if let Some(addr) = &self.primary_addr {
            config.cluster.primary_addr = addr.clone();
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.model.checkpoint_dir = dir.clone();
        }
        if let Some(path) = &self.tokenizer {
            config.model.tokenizer_path = path.clone();
        }
        if let Some(seed) = self.seed {
            config.model.seed = seed;
        }
        if let Some(capacity) = self.payload_capacity {
            config.sync.payload_capacity = capacity;
        }
        if let Some(temperature) = self.temperature {
            config.chat.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            config.chat.top_p = top_p;
        }
        if let Some(max) = self.max_output_length {
            config.chat.max_output_length = max;
        }
    }
}

/// Get default configuration file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".config"))
        .join("tandem")
        .join("config.toml")
}

/// Load configuration from the given file, else from the default location
/// when it exists, else built-in defaults
pub fn load(config_path: Option<&Path>) -> Result<TandemConfig> {
    let mut config = match config_path {
        Some(path) => {
            let path = expand(path)?;
            TandemConfig::from_file(&path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?
        }
        None => {
            let path = default_config_path();
            if path.exists() {
                TandemConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config file: {}", path.display()))?
            } else {
                TandemConfig::default()
            }
        }
    };

    config.model.checkpoint_dir = expand(&config.model.checkpoint_dir)?;
    config.model.tokenizer_path = expand(&config.model.tokenizer_path)?;
    if let Some(preamble_file) = &config.chat.preamble_file {
        config.chat.preamble_file = Some(expand(preamble_file)?);
    }
    Ok(config)
}

/// Expand `~` and environment variables in a configured path
pub fn expand(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {}", path.display()))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = TandemConfig::default();
        let overrides = Overrides {
            rank: Some(2),
            world_size: Some(4),
            temperature: Some(0.0),
            ..Default::default()
        };
        overrides.apply(&mut config);

        assert_eq!(config.cluster.rank, 2);
        assert_eq!(config.cluster.world_size, 4);
        assert_eq!(config.chat.temperature, 0.0);
        assert_eq!(config.chat.top_p, 0.9);
    }

    #[test]
    fn test_load_reads_given_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tandem.toml");
        std::fs::write(
            &path,
            "[cluster]\nworld_size = 3\n\n[chat]\nhistory_length = 4\n",
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.cluster.world_size, 3);
        assert_eq!(config.chat.history_length, 4);
        assert_eq!(config.sync.payload_capacity, 4096);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_expand_leaves_plain_paths() {
        assert_eq!(expand(Path::new("models/7b")).unwrap(), PathBuf::from("models/7b"));
        assert!(expand(Path::new("$TANDEM_SURELY_UNSET_VAR/x")).is_err());
    }
}
