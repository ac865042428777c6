use serde::{Deserialize, Serialize};
use strand_index::IndexConfig;

/// Cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Shape of the per-path member trees.
    pub index: IndexConfig,
    /// Continue into the backend once cached candidates are exhausted.
    pub fall_through: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            fall_through: true,
        }
    }
}
