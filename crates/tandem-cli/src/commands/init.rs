//! Init command: write a default configuration file

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use std::path::PathBuf;

use tandem_core::config::TandemConfig;

use crate::commands::Command;
use crate::config::{default_config_path, expand};
use crate::utils::print_success;

#[derive(Args, Debug)]
pub struct InitCommand {
    /// Where to write the file; defaults to the user configuration directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Replace an existing file
    #[arg(long)]
    pub force: bool,
}

#[async_trait]
impl Command for InitCommand {
    fn needs_config(&self) -> bool {
        false
    }

    async fn execute(&self, _config: &TandemConfig, json_output: bool) -> Result<()> {
        let path = match &self.output {
            Some(path) => expand(path)?,
            None => default_config_path(),
        };
        if path.exists() && !self.force {
            anyhow::bail!("{} already exists; pass --force to replace it", path.display());
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        TandemConfig::default().to_file(&path)?;
        if json_output {
            println!("{}", serde_json::json!({ "written": path }));
        } else {
            print_success(&format!("Wrote {}", path.display()));
        }
        Ok(())
    }
}
