use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_types::Delta;

use crate::error::{PersistError, PersistResult};

/// How replay treats a delta batch that fails to decode or apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Strict when there is no checkpoint to fall back on, lenient otherwise.
    #[default]
    Auto,
    /// Any bad batch fails the whole read.
    Strict,
    /// Bad batches are logged and skipped.
    Lenient,
}

impl ReplayMode {
    pub fn is_strict(self, has_checkpoint: bool) -> bool {
        match self {
            ReplayMode::Auto => !has_checkpoint,
            ReplayMode::Strict => true,
            ReplayMode::Lenient => false,
        }
    }
}

/// Persistence tuning, loadable from TOML.
///
/// ```toml
/// squash_window_ms = 50
/// checkpoint_every = 16
/// replay_mode = "auto"
/// indexed_fields = ["email", "role"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Digest period: mutations inside one window go out in one flush.
    pub squash_window_ms: u64,
    /// Take a checkpoint once this many deltas have been logged since the
    /// last one. Zero disables checkpoints.
    pub checkpoint_every: u32,
    pub replay_mode: ReplayMode,
    /// Top-level keys forming the query projection. Empty means every key.
    pub indexed_fields: Vec<String>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            squash_window_ms: 50,
            checkpoint_every: 16,
            replay_mode: ReplayMode::Auto,
            indexed_fields: Vec::new(),
        }
    }
}

impl PersistConfig {
    pub fn from_toml_str(s: &str) -> PersistResult<Self> {
        toml::from_str(s).map_err(|e| PersistError::Config(e.to_string()))
    }

    pub fn squash_window(&self) -> Duration {
        Duration::from_millis(self.squash_window_ms)
    }

    /// Whether `delta` belongs in the query projection. Whole-record deletes
    /// always do.
    pub fn projects(&self, delta: &Delta) -> bool {
        if self.indexed_fields.is_empty() || delta.is_record_delete() {
            return true;
        }
        delta
            .top_key()
            .is_some_and(|key| self.indexed_fields.iter().any(|f| f == key))
    }
}

#[cfg(test)]
mod tests {
    use strand_types::{parse_path, DeltaOp, Fragment, LogicalTime, RecordId};

    use super::*;

    fn delta(path: &str, op: DeltaOp) -> Delta {
        Delta {
            target: RecordId::new("r"),
            op,
            path: parse_path(path),
            value: (op != DeltaOp::Delete).then(|| Fragment::scalar(1i64)),
            time: LogicalTime::new(0, 0),
        }
    }

    #[test]
    fn defaults() {
        let c = PersistConfig::default();
        assert_eq!(c.squash_window(), Duration::from_millis(50));
        assert_eq!(c.checkpoint_every, 16);
        assert_eq!(c.replay_mode, ReplayMode::Auto);
        assert!(c.indexed_fields.is_empty());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = PersistConfig::from_toml_str(
            r#"
            checkpoint_every = 4
            replay_mode = "lenient"
            indexed_fields = ["role"]
            "#,
        )
        .unwrap();
        assert_eq!(c.checkpoint_every, 4);
        assert_eq!(c.replay_mode, ReplayMode::Lenient);
        assert_eq!(c.squash_window_ms, 50);
        assert_eq!(c.indexed_fields, ["role"]);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let err = PersistConfig::from_toml_str("replay_mode = \"sometimes\"").unwrap_err();
        assert!(matches!(err, PersistError::Config(_)));
    }

    #[test]
    fn auto_mode_depends_on_checkpoint() {
        assert!(ReplayMode::Auto.is_strict(false));
        assert!(!ReplayMode::Auto.is_strict(true));
        assert!(ReplayMode::Strict.is_strict(true));
        assert!(!ReplayMode::Lenient.is_strict(false));
    }

    #[test]
    fn projection_filter() {
        let c = PersistConfig {
            indexed_fields: vec!["role".into()],
            ..Default::default()
        };
        assert!(c.projects(&delta("role", DeltaOp::Modify)));
        assert!(c.projects(&delta("role.name", DeltaOp::Insert)));
        assert!(!c.projects(&delta("bio", DeltaOp::Modify)));
        assert!(c.projects(&delta("", DeltaOp::Delete)));
        assert!(PersistConfig::default().projects(&delta("bio", DeltaOp::Modify)));
    }
}
