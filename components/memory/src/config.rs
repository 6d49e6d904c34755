use dxram_utils::readable_size::ReadableSize;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Whatever};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    pub total_size: ReadableSize,
    pub segment_size: ReadableSize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            total_size: ReadableSize(dxram_common::DEFAULT_HEAP_SIZE),
            segment_size: ReadableSize(dxram_common::DEFAULT_SEGMENT_SIZE),
        }
    }
}

impl HeapConfig {
    /// Applies `DXRAM_HEAP_SIZE` and `DXRAM_SEGMENT_SIZE`, e.g. `512MiB`.
    pub fn with_env_overrides(mut self) -> Result<Self, Whatever> {
        if let Some(v) = size_var("DXRAM_HEAP_SIZE")? {
            self.total_size = v;
        }
        if let Some(v) = size_var("DXRAM_SEGMENT_SIZE")? {
            self.segment_size = v;
        }
        Ok(self)
    }
}

fn size_var(key: &str) -> Result<Option<ReadableSize>, Whatever> {
    match dxram_utils::env::var(key)? {
        Some(v) => v
            .parse::<ReadableSize>()
            .map(Some)
            .map_err(std::io::Error::other)
            .with_whatever_context(|e| format!("Failed to parse {key} environment variable; {e}")),
        None => Ok(None),
    }
}
