use std::path::Path;

use dxram_lookup::LookupConfig;
use dxram_memory::HeapConfig;
use dxram_utils::logger::LoggingOptions;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Whatever};

/// Everything a node reads at start up, one TOML table per component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub heap: HeapConfig,
    pub lookup: LookupConfig,
    pub logging: LoggingOptions,
}

impl NodeConfig {
    /// Reads `path` if given, then applies the `DXRAM_*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, Whatever> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_whatever_context(|e| format!("failed to read {}: {e}", path.display()))?;
                toml::from_str(&text).with_whatever_context(|e| format!("invalid config {}: {e}", path.display()))?
            }
            None => NodeConfig::default(),
        };
        Ok(Self {
            heap: config.heap.with_env_overrides()?,
            lookup: config.lookup.with_env_overrides()?,
            logging: config.logging,
        })
    }
}
