//! Idempotent creation, repair and teardown of the mirror objects.

use std::sync::Arc;

use crate::error::MirrorError;
use crate::ports::{Result, SchemaBackend};
use crate::types::{HistoryMode, MirrorRelation, MIRROR_COLUMNS};

/// What an `ensure_schema` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub created_table: bool,
    /// Set when the delete trigger was missing and has been installed.
    pub installed_trigger: Option<HistoryMode>,
}

pub struct SchemaManager<S> {
    backend: Arc<S>,
    history_mode: Option<HistoryMode>,
}

impl<S> SchemaManager<S>
where
    S: SchemaBackend,
{
    /// `history_mode` is the configured policy; `None` detects it from the
    /// catalog whenever a mode is needed.
    pub fn new(backend: Arc<S>, history_mode: Option<HistoryMode>) -> Self {
        Self {
            backend,
            history_mode,
        }
    }

    /// Whether the primary store keeps history, judged by the presence of
    /// its current-version pointer relation.
    pub async fn detect_history_mode(&self, conn: &mut S::Conn) -> Result<bool> {
        match self.backend.history_pointer_exists(conn).await? {
            Some(found) => Ok(found),
            None => {
                tracing::warn!(
                    target: "state_mirror.schema",
                    "history mode detection inconclusive, assuming history-free"
                );
                Ok(false)
            }
        }
    }

    pub async fn resolve_history_mode(&self, conn: &mut S::Conn) -> Result<HistoryMode> {
        match self.history_mode {
            Some(mode) => Ok(mode),
            None => Ok(HistoryMode::from_keep_history(
                self.detect_history_mode(conn).await?,
            )),
        }
    }

    /// Create whatever mirror objects are missing. Safe to call repeatedly.
    pub async fn ensure_schema(&self, conn: &mut S::Conn) -> Result<SchemaReport> {
        self.ensure_with_mode(conn, None).await
    }

    /// Called right after the primary store created its own schema, when its
    /// history policy is known for certain.
    pub async fn create_schema(
        &self,
        conn: &mut S::Conn,
        keep_history: bool,
    ) -> Result<SchemaReport> {
        self.ensure_with_mode(conn, Some(HistoryMode::from_keep_history(keep_history)))
            .await
    }

    async fn ensure_with_mode(
        &self,
        conn: &mut S::Conn,
        known: Option<HistoryMode>,
    ) -> Result<SchemaReport> {
        let mut report = SchemaReport::default();

        match self.backend.inspect_mirror(conn).await? {
            MirrorRelation::Absent => {
                self.backend.create_mirror(conn).await?;
                report.created_table = true;
            }
            MirrorRelation::Table { columns } => check_columns(&columns)?,
            MirrorRelation::Other { kind } => {
                return Err(MirrorError::SchemaConflict(format!(
                    "mirror name is taken by a {kind}"
                )))
            }
        }

        self.backend.ensure_search_index(conn).await?;

        if !self.backend.trigger_exists(conn).await? {
            let mode = match known {
                Some(mode) => mode,
                None => self.resolve_history_mode(conn).await?,
            };
            self.backend.install_delete_trigger(conn, mode).await?;
            report.installed_trigger = Some(mode);
        }

        tracing::info!(
            target: "state_mirror.schema",
            created_table = report.created_table,
            installed_trigger = ?report.installed_trigger,
            "mirror schema ensured"
        );
        Ok(report)
    }

    /// Remove the mirror table and trigger. The primary store tears down its
    /// own schema afterwards.
    pub async fn drop_schema(&self, conn: &mut S::Conn) -> Result<()> {
        self.backend.drop_mirror(conn).await?;
        tracing::info!(target: "state_mirror.schema", "mirror schema dropped");
        Ok(())
    }
}

fn check_columns(columns: &[String]) -> Result<()> {
    let missing: Vec<&str> = MIRROR_COLUMNS
        .iter()
        .copied()
        .filter(|c| !columns.iter().any(|have| have == c))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(MirrorError::SchemaConflict(format!(
            "existing mirror table lacks column(s): {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, MemoryDatabase};

    fn manager(mode: Option<HistoryMode>) -> SchemaManager<MemoryBackend> {
        SchemaManager::new(Arc::new(MemoryBackend::default()), mode)
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let db = MemoryDatabase::history_free();
        let mut conn = db.connect();
        let m = manager(None);

        let first = m.ensure_schema(&mut conn).await.unwrap();
        assert!(first.created_table);
        assert_eq!(first.installed_trigger, Some(HistoryMode::HistoryFree));
        let after_first = db.schema_snapshot().await;

        let second = m.ensure_schema(&mut conn).await.unwrap();
        assert_eq!(second, SchemaReport::default());
        assert_eq!(db.schema_snapshot().await, after_first);
    }

    #[tokio::test]
    async fn detects_history_from_pointer_relation() {
        let m = manager(None);

        let mut conn = MemoryDatabase::history_preserving().connect();
        assert!(m.detect_history_mode(&mut conn).await.unwrap());

        let mut conn = MemoryDatabase::history_free().connect();
        assert!(!m.detect_history_mode(&mut conn).await.unwrap());
    }

    #[tokio::test]
    async fn explicit_mode_skips_detection() {
        let db = MemoryDatabase::history_free();
        let mut conn = db.connect();
        let m = manager(Some(HistoryMode::HistoryPreserving));
        let report = m.ensure_schema(&mut conn).await.unwrap();
        assert_eq!(report.installed_trigger, Some(HistoryMode::HistoryPreserving));
    }

    #[tokio::test]
    async fn missing_trigger_is_repaired() {
        let db = MemoryDatabase::history_preserving();
        let mut conn = db.connect();
        let m = manager(None);
        m.ensure_schema(&mut conn).await.unwrap();

        db.remove_trigger().await;
        let report = m.ensure_schema(&mut conn).await.unwrap();
        assert!(!report.created_table);
        assert_eq!(report.installed_trigger, Some(HistoryMode::HistoryPreserving));
    }

    #[tokio::test]
    async fn foreign_relation_is_a_conflict() {
        let db = MemoryDatabase::history_free();
        db.occupy_mirror_name(MirrorRelation::Other { kind: "view".into() })
            .await;
        let err = manager(None)
            .ensure_schema(&mut db.connect())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::SchemaConflict(_)));
    }

    #[tokio::test]
    async fn incompatible_table_is_a_conflict() {
        let db = MemoryDatabase::history_free();
        db.occupy_mirror_name(MirrorRelation::Table {
            columns: vec!["object_id".into(), "state".into()],
        })
        .await;
        let err = manager(None)
            .ensure_schema(&mut db.connect())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("type_name"));
        assert!(err.to_string().contains("pruned_payload"));
    }

    #[tokio::test]
    async fn drop_removes_table_and_trigger() {
        let db = MemoryDatabase::history_free();
        let mut conn = db.connect();
        let m = manager(None);
        m.ensure_schema(&mut conn).await.unwrap();
        m.drop_schema(&mut conn).await.unwrap();

        let snap = db.schema_snapshot().await;
        assert_eq!(snap.mirror, MirrorRelation::Absent);
        assert_eq!(snap.trigger, None);
        assert!(!snap.search_index);
    }
}
