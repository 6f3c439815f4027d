//! In-memory backend for tests and local development.
//!
//! Emulates the relations the Postgres adapter works with: the primary
//! version relation with its optional current-version pointer, the durable
//! mirror, auxiliary tables, and a staging relation that exists only inside
//! a transaction. A transaction works on a private copy of every table and
//! commits by replacing the shared copy, so concurrent writers are not
//! isolated from each other; use one writer at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::MergeLockMode;
use crate::error::MirrorError;
use crate::ports::{Backend, MergePlan, MirrorBackend, Result, SchemaBackend};
use crate::trigger::{decide, DeleteAction, DeletedVersion};
use crate::types::{
    AuxRefresh, HistoryMode, MergeReport, MirrorRelation, MirrorRow, MIRROR_COLUMNS,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    versions: BTreeMap<(i64, i64), Vec<u8>>,
    /// Current-version pointers; `None` when the store keeps no history.
    current: Option<BTreeMap<i64, i64>>,
    mirror: Option<BTreeMap<i64, MirrorRow>>,
    /// Something other than the mirror occupying its name.
    squatter: Option<MirrorRelation>,
    search_index: bool,
    trigger: Option<HistoryMode>,
    aux: BTreeMap<String, BTreeSet<i64>>,
}

impl Tables {
    fn mirror_mut(&mut self) -> Result<&mut BTreeMap<i64, MirrorRow>> {
        self.mirror
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("relation \"mirror\" does not exist").into())
    }

    fn delete_version(&mut self, object_id: i64, version_id: i64) -> bool {
        if self.versions.remove(&(object_id, version_id)).is_none() {
            return false;
        }
        if let Some(mode) = self.trigger {
            let current = self
                .current
                .as_ref()
                .and_then(|c| c.get(&object_id).copied());
            let deleted = DeletedVersion {
                object_id,
                version_id,
            };
            if decide(mode, deleted, current) == DeleteAction::RemoveMirrorRow {
                if let Some(mirror) = self.mirror.as_mut() {
                    mirror.remove(&object_id);
                }
                // Auxiliary tables reference the mirror with ON DELETE CASCADE.
                for rows in self.aux.values_mut() {
                    rows.remove(&object_id);
                }
            }
        }
        true
    }
}

#[derive(Debug)]
struct Txn {
    tables: Tables,
    staging: Option<Staging>,
}

/// Transaction-scoped staging relations.
#[derive(Debug, Default)]
struct Staging {
    rows: BTreeMap<i64, MirrorRow>,
    restored: BTreeSet<i64>,
}

/// Catalog-level view of the mirror objects, for idempotence checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub mirror: MirrorRelation,
    pub search_index: bool,
    pub trigger: Option<HistoryMode>,
}

/// Shared in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryDatabase {
    /// A primary store that keeps only the latest version of each object.
    pub fn history_free() -> Self {
        Self::default()
    }

    /// A primary store with a current-version pointer relation.
    pub fn history_preserving() -> Self {
        let tables = Tables {
            current: Some(BTreeMap::new()),
            ..Tables::default()
        };
        Self {
            tables: Arc::new(Mutex::new(tables)),
        }
    }

    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            db: self.clone(),
            txn: None,
        }
    }

    pub async fn schema_snapshot(&self) -> SchemaSnapshot {
        let t = self.tables.lock().await;
        SchemaSnapshot {
            mirror: inspect(&t),
            search_index: t.search_index,
            trigger: t.trigger,
        }
    }

    /// Committed mirror rows, ordered by object id.
    pub async fn mirror_rows(&self) -> Vec<MirrorRow> {
        let t = self.tables.lock().await;
        t.mirror
            .as_ref()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn mirror_row(&self, object_id: i64) -> Option<MirrorRow> {
        let t = self.tables.lock().await;
        t.mirror.as_ref().and_then(|m| m.get(&object_id).cloned())
    }

    pub async fn aux_rows(&self, table: &str) -> Option<BTreeSet<i64>> {
        self.tables.lock().await.aux.get(table).cloned()
    }

    /// Create an auxiliary table; the mirror never creates them itself.
    pub async fn create_aux_table(&self, table: &str) {
        self.tables
            .lock()
            .await
            .aux
            .entry(table.to_owned())
            .or_default();
    }

    pub async fn remove_trigger(&self) {
        self.tables.lock().await.trigger = None;
    }

    pub async fn occupy_mirror_name(&self, relation: MirrorRelation) {
        self.tables.lock().await.squatter = Some(relation);
    }

    /// Physically delete a committed version, firing the delete trigger.
    pub async fn delete_version(&self, object_id: i64, version_id: i64) -> bool {
        self.tables
            .lock()
            .await
            .delete_version(object_id, version_id)
    }
}

fn inspect(t: &Tables) -> MirrorRelation {
    if let Some(relation) = &t.squatter {
        return relation.clone();
    }
    match t.mirror {
        Some(_) => MirrorRelation::Table {
            columns: MIRROR_COLUMNS.iter().map(|c| c.to_string()).collect(),
        },
        None => MirrorRelation::Absent,
    }
}

/// One session on a [`MemoryDatabase`]. Without an open transaction every
/// operation commits immediately.
#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
    txn: Option<Txn>,
}

impl MemoryConnection {
    pub async fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(MirrorError::InvalidInput(
                "transaction already in progress".into(),
            ));
        }
        let tables = self.db.tables.lock().await.clone();
        self.txn = Some(Txn {
            tables,
            staging: None,
        });
        Ok(())
    }

    /// Publish the transaction's tables; the staging relation is dropped.
    pub async fn commit(&mut self) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| MirrorError::InvalidInput("no transaction in progress".into()))?;
        *self.db.tables.lock().await = txn.tables;
        Ok(())
    }

    pub fn rollback(&mut self) {
        self.txn = None;
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Store an object version the way the primary store does, moving the
    /// current-version pointer when history is kept.
    pub async fn write_version(&mut self, object_id: i64, version_id: i64, payload: &[u8]) {
        self.with_tables(|t| {
            t.versions.insert((object_id, version_id), payload.to_vec());
            if let Some(current) = t.current.as_mut() {
                current.insert(object_id, version_id);
            }
        })
        .await
    }

    pub async fn set_current(&mut self, object_id: i64, version_id: Option<i64>) {
        self.with_tables(|t| {
            if let Some(current) = t.current.as_mut() {
                match version_id {
                    Some(tid) => current.insert(object_id, tid),
                    None => current.remove(&object_id),
                };
            }
        })
        .await
    }

    pub async fn delete_version(&mut self, object_id: i64, version_id: i64) -> bool {
        self.with_tables(|t| t.delete_version(object_id, version_id))
            .await
    }

    /// Mirror row as seen by this session (including uncommitted merges).
    pub async fn mirror_row(&mut self, object_id: i64) -> Option<MirrorRow> {
        self.with_tables(|t| t.mirror.as_ref().and_then(|m| m.get(&object_id).cloned()))
            .await
    }

    /// Staged rows of the open transaction, if the staging relation exists.
    pub fn staged_rows(&self) -> Option<Vec<MirrorRow>> {
        self.txn
            .as_ref()
            .and_then(|txn| txn.staging.as_ref())
            .map(|s| s.rows.values().cloned().collect())
    }

    /// Ids the restore path recorded in the open transaction.
    pub fn restored_ids(&self) -> Option<Vec<i64>> {
        self.txn
            .as_ref()
            .and_then(|txn| txn.staging.as_ref())
            .map(|s| s.restored.iter().copied().collect())
    }

    async fn with_tables<R>(&mut self, f: impl FnOnce(&mut Tables) -> R) -> R {
        match self.txn.as_mut() {
            Some(txn) => f(&mut txn.tables),
            None => f(&mut *self.db.tables.lock().await),
        }
    }

    fn txn_mut(&mut self) -> Result<&mut Txn> {
        self.txn.as_mut().ok_or_else(|| {
            MirrorError::InvalidInput("staging requires an open transaction".into())
        })
    }
}

/// Backend over [`MemoryConnection`]s, with optional fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    fail_merge_after: Option<usize>,
}

impl MemoryBackend {
    /// Fail every merge after upserting `upserts` rows.
    pub fn with_merge_fault(upserts: usize) -> Self {
        Self {
            fail_merge_after: Some(upserts),
        }
    }
}

impl Backend for MemoryBackend {
    type Conn = MemoryConnection;
}

#[async_trait]
impl MirrorBackend for MemoryBackend {
    async fn ensure_staging(&self, conn: &mut MemoryConnection) -> Result<()> {
        conn.txn_mut()?.staging.get_or_insert_with(Staging::default);
        Ok(())
    }

    async fn stage_batch(&self, conn: &mut MemoryConnection, rows: &[MirrorRow]) -> Result<()> {
        let staging = conn
            .txn_mut()?
            .staging
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("relation \"temp staging\" does not exist"))?;
        for row in rows {
            staging.rows.insert(row.object_id, row.clone());
        }
        Ok(())
    }

    // Table locks have no in-process counterpart; one writer at a time.
    async fn restore_batch(
        &self,
        conn: &mut MemoryConnection,
        rows: &[MirrorRow],
        _lock: MergeLockMode,
    ) -> Result<()> {
        let txn = conn.txn_mut()?;
        let staging = txn
            .staging
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("relation \"temp staging\" does not exist"))?;
        let mirror = txn.tables.mirror_mut()?;
        for row in rows {
            mirror.insert(row.object_id, row.clone());
            staging.restored.insert(row.object_id);
        }
        Ok(())
    }

    async fn merge_staged(
        &self,
        conn: &mut MemoryConnection,
        plan: &MergePlan<'_>,
    ) -> Result<MergeReport> {
        let txn = conn.txn_mut()?;
        let (staged, restored) = txn
            .staging
            .as_ref()
            .map(|s| (s.rows.clone(), s.restored.clone()))
            .unwrap_or_default();
        let tables = &mut txn.tables;
        let mut report = MergeReport {
            restored: plan.restored,
            performed: true,
            ..MergeReport::default()
        };

        let mirror = tables.mirror_mut()?;
        for (upserted, row) in staged.values().enumerate() {
            if self.fail_merge_after == Some(upserted) {
                return Err(MirrorError::merge(anyhow::anyhow!(
                    "injected fault after {upserted} upsert(s)"
                )));
            }
            mirror.insert(row.object_id, row.clone());
            report.upserted += 1;
        }

        let touched: BTreeSet<i64> = staged
            .keys()
            .copied()
            .chain(restored.iter().copied())
            .collect();
        let live: BTreeSet<i64> = touched
            .iter()
            .copied()
            .filter(|id| mirror.contains_key(id))
            .collect();

        for table in plan.auxiliary_tables {
            let rows = tables.aux.get_mut(table.as_str()).ok_or_else(|| {
                MirrorError::merge(anyhow::anyhow!("relation \"{table}\" does not exist"))
            })?;
            let before = rows.len();
            rows.retain(|id| !touched.contains(id));
            let deleted = (before - rows.len()) as u64;
            rows.extend(live.iter().copied());
            report.aux.push(AuxRefresh {
                table: table.to_string(),
                deleted,
                inserted: live.len() as u64,
            });
        }

        Ok(report)
    }
}

#[async_trait]
impl SchemaBackend for MemoryBackend {
    async fn inspect_mirror(&self, conn: &mut MemoryConnection) -> Result<MirrorRelation> {
        Ok(conn.with_tables(|t| inspect(t)).await)
    }

    async fn create_mirror(&self, conn: &mut MemoryConnection) -> Result<()> {
        conn.with_tables(|t| {
            if t.mirror.is_some() {
                return Err(MirrorError::SchemaConflict("mirror already exists".into()));
            }
            t.mirror = Some(BTreeMap::new());
            Ok(())
        })
        .await
    }

    async fn ensure_search_index(&self, conn: &mut MemoryConnection) -> Result<()> {
        conn.with_tables(|t| {
            t.mirror_mut()?;
            t.search_index = true;
            Ok(())
        })
        .await
    }

    async fn history_pointer_exists(&self, conn: &mut MemoryConnection) -> Result<Option<bool>> {
        Ok(Some(conn.with_tables(|t| t.current.is_some()).await))
    }

    async fn trigger_exists(&self, conn: &mut MemoryConnection) -> Result<bool> {
        Ok(conn.with_tables(|t| t.trigger.is_some()).await)
    }

    async fn install_delete_trigger(
        &self,
        conn: &mut MemoryConnection,
        mode: HistoryMode,
    ) -> Result<()> {
        conn.with_tables(|t| t.trigger = Some(mode)).await;
        Ok(())
    }

    async fn drop_mirror(&self, conn: &mut MemoryConnection) -> Result<()> {
        conn.with_tables(|t| {
            t.mirror = None;
            t.search_index = false;
            t.trigger = None;
        })
        .await;
        Ok(())
    }
}
