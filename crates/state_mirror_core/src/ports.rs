//! Storage port traits and the extension points a primary store calls.
//! Implemented by state_mirror_postgres and by [`crate::memory`]; the core
//! logic depends only on these traits.

use async_trait::async_trait;

use crate::config::MergeLockMode;
use crate::error::MirrorError;
use crate::types::{HistoryMode, MergeReport, MirrorRelation, MirrorRow, SqlIdent};

pub type Result<T> = std::result::Result<T, MirrorError>;

/// Names the connection type a backend operates on.
///
/// The primary store owns connections and transactions; backends only borrow
/// the connection of the transaction in flight.
pub trait Backend: Send + Sync {
    type Conn: Send;
}

/// What a merge must do beyond upserting the staged rows.
#[derive(Debug, Clone, Copy)]
pub struct MergePlan<'a> {
    pub tid: i64,
    pub lock: MergeLockMode,
    pub auxiliary_tables: &'a [SqlIdent],
    /// Rows the restore path wrote in this transaction, for the report.
    pub restored: usize,
}

/// Row movement between the staging relation and the durable mirror.
#[async_trait]
pub trait MirrorBackend: Backend {
    /// Create the transaction-scoped staging relations (staged rows and
    /// restored ids) if they do not exist.
    async fn ensure_staging(&self, conn: &mut Self::Conn) -> Result<()>;

    /// Replace the staged row of every object id in `rows`.
    async fn stage_batch(&self, conn: &mut Self::Conn, rows: &[MirrorRow]) -> Result<()>;

    /// Replace the durable mirror row of every object id in `rows` and record
    /// the ids in the staging area for the auxiliary refresh.
    ///
    /// Takes the `lock` a merge would take before touching the mirror, so a
    /// restoring transaction never holds a weaker lock its merge must upgrade.
    async fn restore_batch(
        &self,
        conn: &mut Self::Conn,
        rows: &[MirrorRow],
        lock: MergeLockMode,
    ) -> Result<()>;

    /// Upsert all staged rows into the durable mirror in object id order,
    /// then refresh the auxiliary tables for the staged and restored ids.
    async fn merge_staged(&self, conn: &mut Self::Conn, plan: &MergePlan<'_>)
        -> Result<MergeReport>;
}

/// Catalog inspection and DDL for the mirror objects.
#[async_trait]
pub trait SchemaBackend: Backend {
    async fn inspect_mirror(&self, conn: &mut Self::Conn) -> Result<MirrorRelation>;

    /// Create the durable mirror table. Only called when it is absent.
    async fn create_mirror(&self, conn: &mut Self::Conn) -> Result<()>;

    async fn ensure_search_index(&self, conn: &mut Self::Conn) -> Result<()>;

    /// Whether the primary store has a current-version pointer relation.
    /// `None` when the catalog gives no usable answer.
    async fn history_pointer_exists(&self, conn: &mut Self::Conn) -> Result<Option<bool>>;

    async fn trigger_exists(&self, conn: &mut Self::Conn) -> Result<bool>;

    /// Install (or replace) the delete-propagation procedure and trigger.
    async fn install_delete_trigger(&self, conn: &mut Self::Conn, mode: HistoryMode)
        -> Result<()>;

    /// Drop the mirror table and the trigger procedure with its trigger.
    async fn drop_mirror(&self, conn: &mut Self::Conn) -> Result<()>;
}

/// Extension points a primary object store invokes during its lifecycle.
///
/// | Hook                  | Called by the primary store                          |
/// |-----------------------|------------------------------------------------------|
/// | `on_session_open`     | at the start of every storing transaction            |
/// | `on_object_write`     | for each object version stored in the transaction    |
/// | `after_restore`       | for each version copied in by restore                |
/// | `before_commit_merge` | after its own commit-time move, before it is durable |
/// | `on_schema_create`    | after creating its own schema                        |
/// | `on_schema_update`    | when checking/upgrading an existing schema           |
/// | `on_schema_drop`      | before dropping its own schema                       |
///
/// Any error returned from a write or commit hook must abort the transaction.
/// Rolling back needs no hook: the session is simply dropped.
#[async_trait]
pub trait StoreExtension: Send + Sync {
    type Conn: Send;
    type Session: Send;

    async fn on_session_open(&self, conn: &mut Self::Conn) -> Result<Self::Session>;

    async fn on_object_write(
        &self,
        conn: &mut Self::Conn,
        session: &mut Self::Session,
        object_id: i64,
        payload: &[u8],
    ) -> Result<()>;

    async fn after_restore(
        &self,
        conn: &mut Self::Conn,
        session: &mut Self::Session,
        object_id: i64,
        version_id: i64,
        payload: &[u8],
    ) -> Result<()>;

    async fn before_commit_merge(
        &self,
        conn: &mut Self::Conn,
        session: &mut Self::Session,
        tid: i64,
    ) -> Result<MergeReport>;

    async fn on_schema_create(&self, conn: &mut Self::Conn, keep_history: bool) -> Result<()>;

    async fn on_schema_update(&self, conn: &mut Self::Conn) -> Result<()>;

    async fn on_schema_drop(&self, conn: &mut Self::Conn) -> Result<()>;
}
