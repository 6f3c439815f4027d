//! Keyed write buffer feeding bulk delete-then-insert statements.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::MirrorRow;

/// Flush thresholds for a [`RowBatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    /// Buffered rows that trigger a flush.
    pub row_limit: usize,
    /// Buffered bytes (sum of row size hints) that trigger a flush.
    pub size_limit: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            row_limit: 100,
            size_limit: 1 << 20,
        }
    }
}

/// Buffers mirror rows keyed by object id; the last write per id wins.
///
/// A flush deletes every drained id from the target relation and then
/// inserts the drained rows, so a row already flushed for the same id in an
/// earlier batch is replaced too.
#[derive(Debug, Default)]
pub struct RowBatcher {
    limits: BatchLimits,
    rows: BTreeMap<i64, (MirrorRow, usize)>,
    bytes: usize,
}

impl RowBatcher {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            rows: BTreeMap::new(),
            bytes: 0,
        }
    }

    /// Buffer a row. Returns true once a flush threshold is reached.
    pub fn push(&mut self, row: MirrorRow) -> bool {
        let size = row.size_hint();
        if let Some((_, old)) = self.rows.insert(row.object_id, (row, size)) {
            self.bytes -= old;
        }
        self.bytes += size;
        self.should_flush()
    }

    pub fn should_flush(&self) -> bool {
        self.rows.len() >= self.limits.row_limit.max(1) || self.bytes >= self.limits.size_limit
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.bytes
    }

    /// Take every buffered row, ordered by object id.
    pub fn drain(&mut self) -> Vec<MirrorRow> {
        self.bytes = 0;
        std::mem::take(&mut self.rows)
            .into_values()
            .map(|(row, _)| row)
            .collect()
    }
}
