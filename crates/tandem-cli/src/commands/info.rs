//! Info command: show the resolved configuration and shard layout

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use serde_json::json;
use tracing::debug;

use tandem_core::{config::TandemConfig, shard::ShardManifest};

use crate::commands::Command;
use crate::config::Overrides;
use crate::utils::print_output;

#[derive(Args, Debug)]
pub struct InfoCommand {
    #[command(flatten)]
    pub overrides: Overrides,

    /// Skip scanning the checkpoint directory
    #[arg(long)]
    pub no_shards: bool,
}

#[async_trait]
impl Command for InfoCommand {
    fn apply_overrides(&self, config: &mut TandemConfig) {
        self.overrides.apply(config);
    }

    async fn execute(&self, config: &TandemConfig, json_output: bool) -> Result<()> {
        debug!("Executing info command with config: {:?}", self);
        print_output(&self.describe(config), json_output)
    }
}

impl InfoCommand {
    /// Problems are reported alongside the configuration rather than failing,
    /// so the output is useful for diagnosing a broken setup
    fn describe(&self, config: &TandemConfig) -> serde_json::Value {
        let mut info = json!({
            "config": config,
            "valid": config.validate().is_ok(),
        });
        if let Err(e) = config.validate() {
            info["config_error"] = json!({ "code": e.code(), "message": e.to_string() });
        }

        match config.chat.resolve_preamble() {
            Ok(preamble) => {
                info["fingerprint"] = json!(format!("{:016x}", config.fingerprint(&preamble)));
            }
            Err(e) => {
                info["preamble_error"] = json!({ "code": e.code(), "message": e.to_string() });
            }
        }

        if !self.no_shards {
            match ShardManifest::discover(
                &config.model.checkpoint_dir,
                &config.model.shard_extension,
                config.cluster.world_size,
            ) {
                Ok(manifest) => {
                    info["shards"] = json!(&manifest);
                    if let Ok(path) = manifest.shard_for(config.cluster.rank) {
                        info["this_rank_shard"] = json!(path);
                    }
                }
                Err(e) => {
                    info["shards_error"] = json!({ "code": e.code(), "message": e.to_string() });
                }
            }
        }

        info
    }
}
