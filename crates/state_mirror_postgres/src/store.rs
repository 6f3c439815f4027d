//! Postgres implementation of the state_mirror_core port traits.
//!
//! The adapter borrows the connection of the primary store's transaction in
//! flight; it never begins or commits on its own. All SQL is runtime-checked
//! (sqlx::query, not sqlx::query!) so no database is needed at build time.

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::PgConnection;

use state_mirror_core::error::MirrorError;
use state_mirror_core::ports::{Backend, MergePlan, MirrorBackend, Result, SchemaBackend};
use state_mirror_core::{
    AuxRefresh, HistoryMode, MergeLockMode, MergeReport, MirrorConfig, MirrorRelation, MirrorRow,
    PrimaryLayout,
};

use crate::sql;

/// Postgres-backed mirror store for a primary store with the given layout.
#[derive(Debug, Clone, Default)]
pub struct PgMirrorStore {
    layout: PrimaryLayout,
}

impl PgMirrorStore {
    pub fn new(layout: PrimaryLayout) -> Self {
        Self { layout }
    }

    pub fn from_config(config: &MirrorConfig) -> Self {
        Self::new(config.primary.clone())
    }

    pub fn layout(&self) -> &PrimaryLayout {
        &self.layout
    }

    /// `pg_class.relkind` of a relation resolved through the search path.
    async fn relkind(conn: &mut PgConnection, relation: &str) -> Result<Option<String>> {
        let kind: Option<String> = sqlx::query_scalar(sql::RELKIND)
            .bind(relation)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(kind)
    }

    async fn lock_mirror(conn: &mut PgConnection, lock: MergeLockMode) -> Result<()> {
        if let Some(clause) = lock.lock_clause() {
            sqlx::query(&sql::lock_mirror(clause))
                .execute(&mut *conn)
                .await
                .map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }

    /// Delete-then-insert `rows` into `table`.
    async fn replace_rows(conn: &mut PgConnection, table: &str, rows: &[MirrorRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns = RowColumns::from_rows(rows)?;

        sqlx::query(&sql::delete_ids(table))
            .bind(&columns.object_ids)
            .execute(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;

        sqlx::query(&sql::insert_unnest(table))
            .bind(&columns.object_ids)
            .bind(&columns.type_names)
            .bind(&columns.pruned_payloads)
            .bind(&columns.states)
            .execute(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

/// Column-wise arrays bound to an `UNNEST` insert.
struct RowColumns {
    object_ids: Vec<i64>,
    type_names: Vec<Option<String>>,
    pruned_payloads: Vec<Option<Vec<u8>>>,
    states: Vec<String>,
}

impl RowColumns {
    fn from_rows(rows: &[MirrorRow]) -> Result<Self> {
        let mut columns = Self {
            object_ids: Vec::with_capacity(rows.len()),
            type_names: Vec::with_capacity(rows.len()),
            pruned_payloads: Vec::with_capacity(rows.len()),
            states: Vec::with_capacity(rows.len()),
        };
        for row in rows {
            columns.object_ids.push(row.object_id);
            columns.type_names.push(row.type_name.clone());
            columns.pruned_payloads.push(row.pruned_payload.clone());
            columns
                .states
                .push(serde_json::to_string(&row.state).map_err(|e| anyhow!(e))?);
        }
        Ok(columns)
    }
}

impl Backend for PgMirrorStore {
    type Conn = PgConnection;
}

#[async_trait]
impl MirrorBackend for PgMirrorStore {
    async fn ensure_staging(&self, conn: &mut PgConnection) -> Result<()> {
        for statement in [sql::CREATE_STAGING, sql::CREATE_RESTORED_STAGING] {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }

    async fn stage_batch(&self, conn: &mut PgConnection, rows: &[MirrorRow]) -> Result<()> {
        tracing::debug!(target: "state_mirror.stage", rows = rows.len(), "staging batch");
        Self::replace_rows(conn, sql::STAGING_TABLE, rows).await
    }

    async fn restore_batch(
        &self,
        conn: &mut PgConnection,
        rows: &[MirrorRow],
        lock: MergeLockMode,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        tracing::debug!(target: "state_mirror.restore", rows = rows.len(), "restoring batch");
        // Same lock the merge takes; acquiring it later would be an upgrade.
        Self::lock_mirror(conn, lock).await?;
        Self::replace_rows(conn, sql::MIRROR_TABLE, rows).await?;

        let ids: Vec<i64> = rows.iter().map(|r| r.object_id).collect();
        sqlx::query(sql::RECORD_RESTORED)
            .bind(&ids)
            .execute(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn merge_staged(
        &self,
        conn: &mut PgConnection,
        plan: &MergePlan<'_>,
    ) -> Result<MergeReport> {
        Self::lock_mirror(conn, plan.lock)
            .await
            .map_err(MirrorError::merge)?;

        let upserted = sqlx::query(sql::UPSERT_STAGED)
            .execute(&mut *conn)
            .await
            .map_err(MirrorError::merge)?
            .rows_affected();

        let mut report = MergeReport {
            upserted,
            restored: plan.restored,
            aux: Vec::with_capacity(plan.auxiliary_tables.len()),
            performed: true,
        };

        for table in plan.auxiliary_tables {
            let deleted = sqlx::query(&sql::aux_delete(table))
                .execute(&mut *conn)
                .await
                .map_err(MirrorError::merge)?
                .rows_affected();
            let inserted = sqlx::query(&sql::aux_insert(table))
                .execute(&mut *conn)
                .await
                .map_err(MirrorError::merge)?
                .rows_affected();
            tracing::debug!(
                target: "state_mirror.merge",
                tid = plan.tid,
                table = %table,
                deleted,
                inserted,
                "auxiliary table refreshed"
            );
            report.aux.push(AuxRefresh {
                table: table.to_string(),
                deleted,
                inserted,
            });
        }

        Ok(report)
    }
}

#[async_trait]
impl SchemaBackend for PgMirrorStore {
    async fn inspect_mirror(&self, conn: &mut PgConnection) -> Result<MirrorRelation> {
        let Some(kind) = Self::relkind(conn, sql::MIRROR_TABLE).await? else {
            return Ok(MirrorRelation::Absent);
        };
        if !sql::is_table(&kind) {
            return Ok(MirrorRelation::Other {
                kind: sql::relkind_name(&kind).to_owned(),
            });
        }
        let columns: Vec<String> = sqlx::query_scalar(sql::COLUMNS)
            .bind(sql::MIRROR_TABLE)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(MirrorRelation::Table { columns })
    }

    async fn create_mirror(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(sql::CREATE_MIRROR)
            .execute(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;
        tracing::info!(target: "state_mirror.schema", table = sql::MIRROR_TABLE, "mirror table created");
        Ok(())
    }

    async fn ensure_search_index(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(sql::CREATE_SEARCH_INDEX)
            .execute(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn history_pointer_exists(&self, conn: &mut PgConnection) -> Result<Option<bool>> {
        let kind = Self::relkind(conn, self.layout.current_table.as_str()).await?;
        Ok(match kind.as_deref() {
            None => Some(false),
            Some(k) if sql::is_table(k) => Some(true),
            Some(k) => {
                tracing::debug!(
                    target: "state_mirror.schema",
                    relation = %self.layout.current_table,
                    kind = sql::relkind_name(k),
                    "current-version relation is not a table"
                );
                None
            }
        })
    }

    async fn trigger_exists(&self, conn: &mut PgConnection) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(sql::TRIGGER_EXISTS)
            .bind(sql::DELETE_TRIGGER)
            .bind(self.layout.version_table.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(exists)
    }

    async fn install_delete_trigger(
        &self,
        conn: &mut PgConnection,
        mode: HistoryMode,
    ) -> Result<()> {
        let statements = [
            sql::trigger_function(mode, &self.layout),
            sql::drop_trigger(&self.layout),
            sql::create_trigger(&self.layout),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| anyhow!(e))?;
        }
        tracing::info!(
            target: "state_mirror.schema",
            %mode,
            table = %self.layout.version_table,
            "delete trigger installed"
        );
        Ok(())
    }

    async fn drop_mirror(&self, conn: &mut PgConnection) -> Result<()> {
        for statement in [sql::DROP_MIRROR, sql::DROP_TRIGGER_FUNCTION] {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }
}
