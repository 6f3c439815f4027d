//! Mirror configuration.
//!
//! Loaded from YAML or from `STATE_MIRROR_*` environment variables; every
//! field has a default so an empty document is a valid configuration.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::batch::BatchLimits;
use crate::error::MirrorError;
use crate::ports::Result;
use crate::transform::JsonStateTransformer;
use crate::types::{HistoryMode, SqlIdent};

/// Table lock taken on the durable mirror before merging staged rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeLockMode {
    /// Self-conflicting; concurrent merges run one after another while plain
    /// readers proceed.
    #[default]
    ShareRowExclusive,
    /// Self-compatible. Two merges holding it deadlock once both upsert, so
    /// this is only safe when the primary store already serializes commits.
    Share,
    /// No table lock; rely on per-row upsert conflict handling.
    None,
}

impl MergeLockMode {
    /// The `LOCK TABLE ... IN <mode> MODE` clause, if any.
    pub fn lock_clause(self) -> Option<&'static str> {
        match self {
            Self::ShareRowExclusive => Some("SHARE ROW EXCLUSIVE"),
            Self::Share => Some("SHARE"),
            Self::None => None,
        }
    }
}

impl FromStr for MergeLockMode {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "share_row_exclusive" => Ok(Self::ShareRowExclusive),
            "share" => Ok(Self::Share),
            "none" => Ok(Self::None),
            other => Err(MirrorError::InvalidInput(format!(
                "unknown merge lock mode: {other}"
            ))),
        }
    }
}

/// Names of the primary store's relations the delete trigger reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryLayout {
    /// Relation holding one row per object version.
    pub version_table: SqlIdent,
    /// Current-version pointer relation; present only when history is kept.
    pub current_table: SqlIdent,
    pub object_id_column: SqlIdent,
    pub version_column: SqlIdent,
}

impl Default for PrimaryLayout {
    fn default() -> Self {
        Self {
            version_table: SqlIdent::from_static("object_state"),
            current_table: SqlIdent::from_static("current_object"),
            object_id_column: SqlIdent::from_static("zoid"),
            version_column: SqlIdent::from_static("tid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Explicit history mode; detected from the catalog when unset.
    pub keep_history: Option<bool>,
    /// Existing tables with an `object_id` column refreshed at every merge.
    pub auxiliary_tables: Vec<SqlIdent>,
    pub merge_lock: MergeLockMode,
    pub batch: BatchLimits,
    /// Payload field naming the object's type for the default transformer.
    pub type_field: String,
    pub primary: PrimaryLayout,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            keep_history: None,
            auxiliary_tables: Vec::new(),
            merge_lock: MergeLockMode::default(),
            batch: BatchLimits::default(),
            type_field: JsonStateTransformer::DEFAULT_TYPE_FIELD.to_owned(),
            primary: PrimaryLayout::default(),
        }
    }
}

impl MirrorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| MirrorError::InvalidInput(format!("mirror config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `STATE_MIRROR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("STATE_MIRROR_KEEP_HISTORY") {
            config.keep_history = match v.trim().to_ascii_lowercase().as_str() {
                "" | "auto" => None,
                "1" | "true" | "yes" => Some(true),
                "0" | "false" | "no" => Some(false),
                other => {
                    return Err(MirrorError::InvalidInput(format!(
                        "STATE_MIRROR_KEEP_HISTORY: expected true/false/auto, got {other}"
                    )))
                }
            };
        }
        if let Some(v) = lookup("STATE_MIRROR_AUXILIARY_TABLES") {
            config.auxiliary_tables = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SqlIdent::new)
                .collect::<Result<_>>()?;
        }
        if let Some(v) = lookup("STATE_MIRROR_MERGE_LOCK") {
            config.merge_lock = v.parse()?;
        }
        if let Some(v) = lookup("STATE_MIRROR_BATCH_ROWS") {
            config.batch.row_limit = parse_usize("STATE_MIRROR_BATCH_ROWS", &v)?;
        }
        if let Some(v) = lookup("STATE_MIRROR_BATCH_BYTES") {
            config.batch.size_limit = parse_usize("STATE_MIRROR_BATCH_BYTES", &v)?;
        }
        if let Some(v) = lookup("STATE_MIRROR_TYPE_FIELD") {
            config.type_field = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.row_limit == 0 || self.batch.size_limit == 0 {
            return Err(MirrorError::InvalidInput(
                "batch limits must be positive".into(),
            ));
        }
        if self.type_field.is_empty() {
            return Err(MirrorError::InvalidInput("type_field is empty".into()));
        }
        for column in [&self.primary.object_id_column, &self.primary.version_column] {
            if column.is_qualified() {
                return Err(MirrorError::InvalidInput(format!(
                    "column name must not be qualified: {column}"
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for table in &self.auxiliary_tables {
            if !seen.insert(table.as_str()) {
                return Err(MirrorError::InvalidInput(format!(
                    "auxiliary table listed twice: {table}"
                )));
            }
        }
        Ok(())
    }

    pub fn history_mode(&self) -> Option<HistoryMode> {
        self.keep_history.map(HistoryMode::from_keep_history)
    }
}

fn parse_usize(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|e| MirrorError::InvalidInput(format!("{key}: {e}")))
}
