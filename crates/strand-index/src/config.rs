use serde::{Deserialize, Serialize};

/// B-tree tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Maximum keys per node. Nodes other than the root keep at least
    /// half as many.
    pub block_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { block_size: 32 }
    }
}
