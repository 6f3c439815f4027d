//! Mirror synchronization driven by the primary store's lifecycle hooks.
//!
//! Object writes are projected and staged per transaction; at commit the
//! staged rows are merged into the durable mirror under the configured table
//! lock, and the auxiliary tables are refreshed against the merged result.
//! Restored versions skip staging and go straight to the durable mirror.

use std::sync::Arc;

use async_trait::async_trait;

use crate::batch::{BatchLimits, RowBatcher};
use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::ports::{Backend, MergePlan, MirrorBackend, Result, SchemaBackend, StoreExtension};
use crate::schema::{SchemaManager, SchemaReport};
use crate::transform::{JsonStateTransformer, Projector};
use crate::types::MergeReport;

/// Mirror state of one storing transaction.
///
/// Lives exactly as long as the transaction: after a merge it is reset, and
/// on rollback it is dropped together with the staging relation.
#[derive(Debug)]
pub struct MirrorSession {
    staged: RowBatcher,
    restored: RowBatcher,
    staged_any: bool,
    restored_any: bool,
    restored_rows: usize,
    staging_ready: bool,
}

impl MirrorSession {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            staged: RowBatcher::new(limits),
            restored: RowBatcher::new(limits),
            staged_any: false,
            restored_any: false,
            restored_rows: 0,
            staging_ready: false,
        }
    }

    /// True when nothing was staged or restored in this transaction.
    pub fn is_idle(&self) -> bool {
        !self.staged_any && !self.restored_any
    }

    fn reset(&mut self) {
        self.staged.drain();
        self.restored.drain();
        self.staged_any = false;
        self.restored_any = false;
        self.restored_rows = 0;
        // The staging relation is dropped at commit.
        self.staging_ready = false;
    }
}

pub struct MirrorCoordinator<B> {
    backend: Arc<B>,
    projector: Projector,
    schema: SchemaManager<B>,
    config: MirrorConfig,
}

impl<B> MirrorCoordinator<B>
where
    B: MirrorBackend + SchemaBackend,
{
    /// Coordinator using the default JSON transformer for `config.type_field`.
    pub fn new(backend: Arc<B>, config: MirrorConfig) -> Result<Self> {
        let projector = Projector::new(Arc::new(JsonStateTransformer::new(
            config.type_field.clone(),
        )));
        Self::with_projector(backend, config, projector)
    }

    pub fn with_projector(
        backend: Arc<B>,
        config: MirrorConfig,
        projector: Projector,
    ) -> Result<Self> {
        config.validate()?;
        let schema = SchemaManager::new(Arc::clone(&backend), config.history_mode());
        Ok(Self {
            backend,
            projector,
            schema,
            config,
        })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn schema(&self) -> &SchemaManager<B> {
        &self.schema
    }

    /// `ensure_schema` with its report, for callers outside the hook flow.
    pub async fn ensure_schema(&self, conn: &mut B::Conn) -> Result<SchemaReport> {
        self.schema.ensure_schema(conn).await
    }

    pub fn new_session(&self) -> MirrorSession {
        MirrorSession::new(self.config.batch)
    }

    /// Stage the projection of an object write. Writes the transformer does
    /// not project leave both staging and mirror untouched.
    pub async fn stage(
        &self,
        conn: &mut B::Conn,
        session: &mut MirrorSession,
        object_id: i64,
        payload: &[u8],
    ) -> Result<bool> {
        let Some(row) = self.projector.project(object_id, payload)? else {
            tracing::debug!(target: "state_mirror.stage", object_id, "not mirrored");
            return Ok(false);
        };
        session.staged_any = true;
        if session.staged.push(row) {
            self.flush_staged(conn, session).await?;
        }
        Ok(true)
    }

    /// Write a restored version's projection directly to the durable mirror.
    pub async fn restore(
        &self,
        conn: &mut B::Conn,
        session: &mut MirrorSession,
        object_id: i64,
        version_id: i64,
        payload: &[u8],
    ) -> Result<bool> {
        let Some(row) = self.projector.project(object_id, payload)? else {
            tracing::debug!(
                target: "state_mirror.restore",
                object_id,
                tid = version_id,
                "not mirrored"
            );
            return Ok(false);
        };
        session.restored_any = true;
        if session.restored.push(row) {
            self.flush_restored(conn, session).await?;
        }
        Ok(true)
    }

    async fn ensure_staging(&self, conn: &mut B::Conn, session: &mut MirrorSession) -> Result<()> {
        if !session.staging_ready {
            self.backend.ensure_staging(conn).await?;
            session.staging_ready = true;
        }
        Ok(())
    }

    async fn flush_staged(&self, conn: &mut B::Conn, session: &mut MirrorSession) -> Result<()> {
        if session.staged.is_empty() {
            return Ok(());
        }
        self.ensure_staging(conn, session).await?;
        let rows = session.staged.drain();
        tracing::debug!(target: "state_mirror.stage", rows = rows.len(), "flushing staged rows");
        self.backend.stage_batch(conn, &rows).await
    }

    async fn flush_restored(
        &self,
        conn: &mut B::Conn,
        session: &mut MirrorSession,
    ) -> Result<()> {
        if session.restored.is_empty() {
            return Ok(());
        }
        // Restored ids are recorded in the staging area.
        self.ensure_staging(conn, session).await?;
        let rows = session.restored.drain();
        tracing::debug!(target: "state_mirror.restore", rows = rows.len(), "writing restored rows");
        self.backend
            .restore_batch(conn, &rows, self.config.merge_lock)
            .await?;
        session.restored_rows += rows.len();
        Ok(())
    }

    /// Merge the session's staged rows into the durable mirror.
    ///
    /// Every failure is reported as [`MirrorError::MergeFailure`]; the caller
    /// must then roll the whole transaction back.
    pub async fn merge(
        &self,
        conn: &mut B::Conn,
        session: &mut MirrorSession,
        tid: i64,
    ) -> Result<MergeReport> {
        if session.is_idle() {
            tracing::debug!(target: "state_mirror.merge", tid, "nothing staged, merge skipped");
            return Ok(MergeReport::default());
        }

        let outcome = self.merge_inner(conn, session, tid).await;
        session.reset();
        let report = outcome.map_err(|e| match e {
            MirrorError::MergeFailure(_) => e,
            other => MirrorError::merge(other),
        })?;

        tracing::info!(
            target: "state_mirror.merge",
            tid,
            upserted = report.upserted,
            restored = report.restored,
            aux_tables = report.aux.len(),
            "mirror merged"
        );
        Ok(report)
    }

    async fn merge_inner(
        &self,
        conn: &mut B::Conn,
        session: &mut MirrorSession,
        tid: i64,
    ) -> Result<MergeReport> {
        self.flush_restored(conn, session).await?;
        self.flush_staged(conn, session).await?;
        // The merge reads the staging area even when only restores ran.
        self.ensure_staging(conn, session).await?;

        let plan = MergePlan {
            tid,
            lock: self.config.merge_lock,
            auxiliary_tables: &self.config.auxiliary_tables,
            restored: session.restored_rows,
        };
        self.backend.merge_staged(conn, &plan).await
    }

    /// Merge, then hand back the primary store's own commit outcome.
    pub async fn merge_on_commit<T: Send>(
        &self,
        conn: &mut B::Conn,
        session: &mut MirrorSession,
        tid: i64,
        primary_outcome: T,
    ) -> Result<T> {
        self.merge(conn, session, tid).await?;
        Ok(primary_outcome)
    }
}

#[async_trait]
impl<B> StoreExtension for MirrorCoordinator<B>
where
    B: MirrorBackend + SchemaBackend,
{
    type Conn = <B as Backend>::Conn;
    type Session = MirrorSession;

    async fn on_session_open(&self, conn: &mut Self::Conn) -> Result<MirrorSession> {
        let mut session = self.new_session();
        self.backend.ensure_staging(conn).await?;
        session.staging_ready = true;
        Ok(session)
    }

    async fn on_object_write(
        &self,
        conn: &mut Self::Conn,
        session: &mut MirrorSession,
        object_id: i64,
        payload: &[u8],
    ) -> Result<()> {
        self.stage(conn, session, object_id, payload).await.map(drop)
    }

    async fn after_restore(
        &self,
        conn: &mut Self::Conn,
        session: &mut MirrorSession,
        object_id: i64,
        version_id: i64,
        payload: &[u8],
    ) -> Result<()> {
        self.restore(conn, session, object_id, version_id, payload)
            .await
            .map(drop)
    }

    async fn before_commit_merge(
        &self,
        conn: &mut Self::Conn,
        session: &mut MirrorSession,
        tid: i64,
    ) -> Result<MergeReport> {
        self.merge(conn, session, tid).await
    }

    async fn on_schema_create(&self, conn: &mut Self::Conn, keep_history: bool) -> Result<()> {
        self.schema.create_schema(conn, keep_history).await.map(drop)
    }

    async fn on_schema_update(&self, conn: &mut Self::Conn) -> Result<()> {
        self.schema.ensure_schema(conn).await.map(drop)
    }

    async fn on_schema_drop(&self, conn: &mut Self::Conn) -> Result<()> {
        self.schema.drop_schema(conn).await
    }
}
