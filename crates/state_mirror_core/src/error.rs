use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("transform failed for object {object_id}: {reason}")]
    Transform { object_id: i64, reason: String },

    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("merge failed: {0}")]
    MergeFailure(#[source] anyhow::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MirrorError {
    pub fn transform(object_id: i64, reason: impl Into<String>) -> Self {
        Self::Transform {
            object_id,
            reason: reason.into(),
        }
    }

    pub fn merge(err: impl Into<anyhow::Error>) -> Self {
        Self::MergeFailure(err.into())
    }

    /// Whether the enclosing transaction must be rolled back.
    ///
    /// Schema and input errors surface before any mirror write; the rest can
    /// leave the session with partially applied statements.
    pub fn aborts_transaction(&self) -> bool {
        match self {
            Self::Transform { .. } | Self::MergeFailure(_) | Self::Internal(_) => true,
            Self::SchemaConflict(_) | Self::InvalidInput(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_transform() {
        let e = MirrorError::transform(42, "not valid JSON");
        assert_eq!(
            e.to_string(),
            "transform failed for object 42: not valid JSON"
        );
    }

    #[test]
    fn display_schema_conflict() {
        let e = MirrorError::SchemaConflict("object_json is a view".into());
        assert_eq!(e.to_string(), "schema conflict: object_json is a view");
    }

    #[test]
    fn display_merge_failure_keeps_source() {
        let e = MirrorError::merge(anyhow::anyhow!("deadlock detected"));
        assert_eq!(e.to_string(), "merge failed: deadlock detected");
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn internal_from_anyhow() {
        let e: MirrorError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(e, MirrorError::Internal(_)));
        assert_eq!(e.to_string(), "internal: connection reset");
    }

    #[test]
    fn abort_classification() {
        assert!(MirrorError::transform(1, "x").aborts_transaction());
        assert!(MirrorError::merge(anyhow::anyhow!("x")).aborts_transaction());
        assert!(!MirrorError::SchemaConflict("x".into()).aborts_transaction());
        assert!(!MirrorError::InvalidInput("x".into()).aborts_transaction());
    }
}
