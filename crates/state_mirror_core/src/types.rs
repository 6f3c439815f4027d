//! Mirror domain types shared by the core logic and the storage adapters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

/// Columns every mirror relation (durable and staging) carries, in order.
pub const MIRROR_COLUMNS: [&str; 4] = ["object_id", "type_name", "pruned_payload", "state"];

/// Output of a state transformer for a single object payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub type_name: String,
    pub pruned_payload: Vec<u8>,
    pub state: serde_json::Value,
}

/// One row of the mirror, durable or staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRow {
    pub object_id: i64,
    pub type_name: Option<String>,
    pub pruned_payload: Option<Vec<u8>>,
    pub state: serde_json::Value,
}

impl MirrorRow {
    pub fn from_projection(object_id: i64, projection: Projection) -> Self {
        Self {
            object_id,
            type_name: Some(projection.type_name),
            pruned_payload: Some(projection.pruned_payload),
            state: projection.state,
        }
    }

    /// Approximate encoded size, used only to pace batch flushes.
    pub fn size_hint(&self) -> usize {
        let state_len = serde_json::to_string(&self.state)
            .map(|s| s.len())
            .unwrap_or_default();
        state_len + self.pruned_payload.as_ref().map_or(0, Vec::len)
    }
}

/// History-retention policy of the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// One version per object; deleting any version removes the object.
    HistoryFree,
    /// All versions kept; a current-version pointer names the live one.
    HistoryPreserving,
}

impl HistoryMode {
    pub fn from_keep_history(keep_history: bool) -> Self {
        if keep_history {
            Self::HistoryPreserving
        } else {
            Self::HistoryFree
        }
    }

    pub fn keeps_history(self) -> bool {
        matches!(self, Self::HistoryPreserving)
    }
}

impl fmt::Display for HistoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HistoryFree => f.write_str("history_free"),
            Self::HistoryPreserving => f.write_str("history_preserving"),
        }
    }
}

/// A SQL identifier that is safe to interpolate into statement text.
///
/// Accepts `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*` and at
/// most 63 bytes (the Postgres `NAMEDATALEN` limit).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SqlIdent(String);

impl SqlIdent {
    pub fn new(raw: impl Into<String>) -> Result<Self, MirrorError> {
        let raw = raw.into();
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() > 2 || !parts.iter().all(|p| is_plain_ident(p)) {
            return Err(MirrorError::InvalidInput(format!(
                "not a plain SQL identifier: {raw:?}"
            )));
        }
        Ok(Self(raw))
    }

    // Only for compile-time literals known to be valid.
    pub(crate) fn from_static(raw: &'static str) -> Self {
        debug_assert!(Self::new(raw).is_ok(), "invalid static identifier {raw}");
        Self(raw.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_qualified(&self) -> bool {
        self.0.contains('.')
    }

    /// The unqualified relation name (the part after any schema prefix).
    pub fn relname(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

fn is_plain_ident(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for SqlIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SqlIdent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SqlIdent::new(raw).map_err(serde::de::Error::custom)
    }
}

/// What currently occupies the mirror table's name in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorRelation {
    Absent,
    Table { columns: Vec<String> },
    /// A non-table relation (view, sequence, index, ...) identified by kind.
    Other { kind: String },
}

/// Rows written to one auxiliary index table during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuxRefresh {
    pub table: String,
    pub deleted: u64,
    pub inserted: u64,
}

/// Outcome of merging a transaction's staged rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub upserted: u64,
    pub restored: usize,
    pub aux: Vec<AuxRefresh>,
    /// False when nothing was staged and the merge was skipped entirely.
    pub performed: bool,
}
