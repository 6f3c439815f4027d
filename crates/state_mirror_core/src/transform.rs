//! Projection of stored object payloads into mirror rows.
//!
//! A [`StateTransformer`] turns a raw payload into a [`Projection`] or decides
//! the object is not mirrored at all. The [`Projector`] wraps a transformer
//! with an optional [`ProjectionHook`] and the checks every projection must
//! pass before it may be staged.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::MirrorError;
use crate::ports::Result;
use crate::types::{MirrorRow, Projection};

/// Maps a raw payload to its mirror projection.
///
/// Implementations must be deterministic and must not retain or mutate the
/// payload. `Ok(None)` means the write leaves the mirror untouched.
pub trait StateTransformer: Send + Sync {
    fn transform(&self, object_id: i64, payload: &[u8]) -> Result<Option<Projection>>;
}

/// Rewrites a projected state before it is persisted.
///
/// `Ok(None)` keeps the state as projected.
pub trait ProjectionHook: Send + Sync {
    fn rewrite(&self, type_name: &str, state: &Value) -> Result<Option<Value>>;
}

impl<F> ProjectionHook for F
where
    F: Fn(&str, &Value) -> Result<Option<Value>> + Send + Sync,
{
    fn rewrite(&self, type_name: &str, state: &Value) -> Result<Option<Value>> {
        self(type_name, state)
    }
}

/// Transformer for payloads stored as JSON objects tagged with a type field.
///
/// `{"@type": "Widget", "color": "red"}` projects to type `Widget`, state
/// `{"color": "red"}`, and `{"@type":"Widget"}` as the pruned payload. The
/// type lives in its own column, so it is removed from the state. Objects
/// without a string type field and non-object documents are not mirrored.
#[derive(Debug, Clone)]
pub struct JsonStateTransformer {
    type_field: String,
}

impl JsonStateTransformer {
    pub const DEFAULT_TYPE_FIELD: &'static str = "@type";

    pub fn new(type_field: impl Into<String>) -> Self {
        Self {
            type_field: type_field.into(),
        }
    }

    pub fn type_field(&self) -> &str {
        &self.type_field
    }
}

impl Default for JsonStateTransformer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TYPE_FIELD)
    }
}

impl StateTransformer for JsonStateTransformer {
    fn transform(&self, object_id: i64, payload: &[u8]) -> Result<Option<Projection>> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| MirrorError::transform(object_id, format!("payload is not UTF-8: {e}")))?;
        let doc: Value = serde_json::from_str(text)
            .map_err(|e| MirrorError::transform(object_id, format!("payload is not JSON: {e}")))?;

        let Value::Object(mut fields) = doc else {
            return Ok(None);
        };
        let type_name = match fields.get(&self.type_field) {
            Some(Value::String(name)) => name.clone(),
            _ => return Ok(None),
        };
        fields.remove(&self.type_field);

        let mut header = Map::new();
        header.insert(self.type_field.clone(), Value::String(type_name.clone()));
        let pruned_payload = serde_json::to_vec(&Value::Object(header))
            .map_err(|e| MirrorError::transform(object_id, e.to_string()))?;

        Ok(Some(Projection {
            type_name,
            pruned_payload,
            state: Value::Object(fields),
        }))
    }
}

/// Transformer plus optional hook, producing ready-to-stage rows.
#[derive(Clone)]
pub struct Projector {
    transformer: Arc<dyn StateTransformer>,
    hook: Option<Arc<dyn ProjectionHook>>,
}

impl Projector {
    pub fn new(transformer: Arc<dyn StateTransformer>) -> Self {
        Self {
            transformer,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ProjectionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Project a payload into a mirror row, or `None` when it is not mirrored.
    pub fn project(&self, object_id: i64, payload: &[u8]) -> Result<Option<MirrorRow>> {
        let Some(mut projection) = self.transformer.transform(object_id, payload)? else {
            return Ok(None);
        };

        if let Some(hook) = &self.hook {
            if let Some(state) = hook.rewrite(&projection.type_name, &projection.state)? {
                projection.state = state;
            }
        }

        ensure_jsonb_safe(object_id, &projection.state)?;
        Ok(Some(MirrorRow::from_projection(object_id, projection)))
    }
}

impl Default for Projector {
    fn default() -> Self {
        Self::new(Arc::new(JsonStateTransformer::default()))
    }
}

impl std::fmt::Debug for Projector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector")
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

// jsonb rejects U+0000 in both keys and string values.
fn ensure_jsonb_safe(object_id: i64, value: &Value) -> Result<()> {
    let bad = |s: &str| s.contains('\u{0}');
    match value {
        Value::String(s) if bad(s) => Err(MirrorError::transform(
            object_id,
            "state contains a NUL character",
        )),
        Value::Array(items) => items
            .iter()
            .try_for_each(|v| ensure_jsonb_safe(object_id, v)),
        Value::Object(fields) => fields.iter().try_for_each(|(k, v)| {
            if bad(k) {
                return Err(MirrorError::transform(
                    object_id,
                    "state key contains a NUL character",
                ));
            }
            ensure_jsonb_safe(object_id, v)
        }),
        _ => Ok(()),
    }
}
