//! Checkpoint shard discovery

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{CoreError, Result};

/// Name of the optional hyper-parameter file next to the shards
pub const PARAMS_FILE: &str = "params.json";

/// Ordered list of shard files, one per rank
#[derive(Debug, Clone, Serialize)]
pub struct ShardManifest {
    pub checkpoint_dir: PathBuf,
    pub shards: Vec<PathBuf>,
    /// Contents of `params.json`, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl ShardManifest {
    /// List the shard files in `dir` with the given extension, sorted by name.
    ///
    /// The number of shards must equal `world_size`: each rank owns exactly
    /// one shard and the assignment is positional.
    pub fn discover(dir: &Path, extension: &str, world_size: usize) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| CoreError::Io {
            code: "SHARD_DIR_READ",
            message: e.to_string(),
            path: Some(dir.to_path_buf()),
            suggestion: "Check model.checkpoint_dir points at the checkpoint directory".to_string(),
            source: e,
        })?;

        let mut shards = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension) {
                shards.push(path);
            }
        }
        shards.sort();

        if shards.len() != world_size {
            return Err(CoreError::Configuration {
                code: "SHARD_COUNT_MISMATCH",
                message: format!(
                    "found {} '.{}' shards but world size is {}",
                    shards.len(),
                    extension,
                    world_size
                ),
                context: "Checkpoint shard discovery".to_string(),
                suggestion: "Launch one process per checkpoint shard".to_string(),
                config_path: Some(dir.to_path_buf()),
                field_name: Some("cluster.world_size".to_string()),
            });
        }

        let params_path = dir.join(PARAMS_FILE);
        let params = if params_path.is_file() {
            let text = std::fs::read_to_string(&params_path)?;
            let value = serde_json::from_str(&text).map_err(|e| CoreError::Configuration {
                code: "SHARD_PARAMS_PARSE",
                message: e.to_string(),
                context: "Reading checkpoint params.json".to_string(),
                suggestion: "Check params.json is valid JSON".to_string(),
                config_path: Some(params_path.clone()),
                field_name: None,
            })?;
            Some(value)
        } else {
            None
        };

        debug!(dir = %dir.display(), shards = shards.len(), "Discovered checkpoint shards");
        Ok(Self {
            checkpoint_dir: dir.to_path_buf(),
            shards,
            params,
        })
    }

    /// Shard file owned by `rank`
    pub fn shard_for(&self, rank: usize) -> Result<&Path> {
        self.shards.get(rank).map(PathBuf::as_path).ok_or_else(|| {
            CoreError::configuration(
                "SHARD_RANK_OUT_OF_RANGE",
                format!("no shard for rank {rank}"),
                format!("{} shards discovered", self.shards.len()),
                "Check cluster.rank against the checkpoint directory",
            )
        })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
