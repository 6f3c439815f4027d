//! SQL text for the mirror objects.
//!
//! Statements that interpolate names only ever see [`SqlIdent`]s, which are
//! validated plain identifiers.

use state_mirror_core::{HistoryMode, PrimaryLayout, SqlIdent};

pub const MIRROR_TABLE: &str = "object_json";
pub const STAGING_TABLE: &str = "temp_object_json";
pub const RESTORED_TABLE: &str = "temp_object_json_restored";
pub const SEARCH_INDEX: &str = "object_json_state_idx";
pub const TRIGGER_FUNCTION: &str = "object_json_delete_on_state_delete";
pub const DELETE_TRIGGER: &str = "object_json_delete_on_state_delete_trigger";

pub(crate) const CREATE_MIRROR: &str = r#"
    CREATE TABLE object_json (
        object_id      bigint PRIMARY KEY,
        type_name      text,
        pruned_payload bytea,
        state          jsonb
    )
"#;

pub(crate) const CREATE_SEARCH_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS object_json_state_idx ON object_json USING gin (state)";

// Dropped with the transaction, so a rollback discards every staged row.
pub(crate) const CREATE_STAGING: &str = r#"
    CREATE TEMPORARY TABLE IF NOT EXISTS temp_object_json (
        object_id      bigint PRIMARY KEY,
        type_name      text,
        pruned_payload bytea,
        state          jsonb
    ) ON COMMIT DROP
"#;

pub(crate) const CREATE_RESTORED_STAGING: &str = r#"
    CREATE TEMPORARY TABLE IF NOT EXISTS temp_object_json_restored (
        object_id bigint PRIMARY KEY
    ) ON COMMIT DROP
"#;

pub(crate) const RECORD_RESTORED: &str = r#"
    INSERT INTO temp_object_json_restored (object_id)
    SELECT unnest($1::bigint[])
    ON CONFLICT (object_id) DO NOTHING
"#;

pub(crate) const DROP_MIRROR: &str = "DROP TABLE IF EXISTS object_json";

pub(crate) const DROP_TRIGGER_FUNCTION: &str =
    "DROP FUNCTION IF EXISTS object_json_delete_on_state_delete() CASCADE";

pub(crate) const RELKIND: &str =
    "SELECT c.relkind::text FROM pg_class c WHERE c.oid = to_regclass($1)";

pub(crate) const COLUMNS: &str = r#"
    SELECT a.attname::text
    FROM pg_attribute a
    WHERE a.attrelid = to_regclass($1)
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

pub(crate) const TRIGGER_EXISTS: &str = r#"
    SELECT EXISTS (
        SELECT 1 FROM pg_trigger
        WHERE tgname = $1
          AND tgrelid = to_regclass($2)
          AND NOT tgisinternal
    )
"#;

/// `DELETE` of the rows for `$1::bigint[]` from `table`.
pub(crate) fn delete_ids(table: &str) -> String {
    format!("DELETE FROM {table} WHERE object_id = ANY($1)")
}

/// Bulk insert from four parallel arrays. `state` travels as text and is
/// cast per row so the driver only needs text arrays.
pub(crate) fn insert_unnest(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (object_id, type_name, pruned_payload, state)
        SELECT u.object_id, u.type_name, u.pruned_payload, u.state::jsonb
        FROM UNNEST($1::bigint[], $2::text[], $3::bytea[], $4::text[])
            AS u(object_id, type_name, pruned_payload, state)
        "#
    )
}

pub(crate) fn lock_mirror(clause: &str) -> String {
    format!("LOCK TABLE {MIRROR_TABLE} IN {clause} MODE")
}

pub(crate) const UPSERT_STAGED: &str = r#"
    INSERT INTO object_json (object_id, type_name, pruned_payload, state)
    SELECT object_id, type_name, pruned_payload, state
    FROM temp_object_json
    ORDER BY object_id
    ON CONFLICT (object_id) DO UPDATE SET
        type_name = EXCLUDED.type_name,
        pruned_payload = EXCLUDED.pruned_payload,
        state = EXCLUDED.state
"#;

// Ids touched by this transaction: staged ones plus restored ones.
const TOUCHED_IDS: &str =
    "SELECT object_id FROM temp_object_json UNION SELECT object_id FROM temp_object_json_restored";

pub(crate) fn aux_delete(table: &SqlIdent) -> String {
    format!("DELETE FROM {table} WHERE object_id IN ({TOUCHED_IDS})")
}

pub(crate) fn aux_insert(table: &SqlIdent) -> String {
    format!(
        "INSERT INTO {table} (object_id) \
         SELECT object_id FROM ({TOUCHED_IDS}) AS t(object_id) \
         JOIN {MIRROR_TABLE} USING (object_id)"
    )
}

/// plpgsql procedure mirroring [`state_mirror_core::trigger::decide`].
pub fn trigger_function(mode: HistoryMode, layout: &PrimaryLayout) -> String {
    let zoid = &layout.object_id_column;
    let tid = &layout.version_column;
    let body = match mode {
        HistoryMode::HistoryFree => format!(
            "BEGIN
  DELETE FROM {MIRROR_TABLE} WHERE object_id = OLD.{zoid};
  RETURN OLD;
END;"
        ),
        HistoryMode::HistoryPreserving => format!(
            "DECLARE
  current_tid bigint;
BEGIN
  SELECT {tid} INTO current_tid FROM {current} WHERE {zoid} = OLD.{zoid};
  IF current_tid IS NULL OR current_tid = OLD.{tid} THEN
    DELETE FROM {MIRROR_TABLE} WHERE object_id = OLD.{zoid};
  END IF;
  RETURN OLD;
END;",
            current = layout.current_table,
        ),
    };
    format!(
        "CREATE OR REPLACE FUNCTION {TRIGGER_FUNCTION}() RETURNS trigger\n\
         LANGUAGE plpgsql AS $mirror$\n{body}\n$mirror$"
    )
}

pub(crate) fn drop_trigger(layout: &PrimaryLayout) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {DELETE_TRIGGER} ON {}",
        layout.version_table
    )
}

pub(crate) fn create_trigger(layout: &PrimaryLayout) -> String {
    format!(
        "CREATE TRIGGER {DELETE_TRIGGER} AFTER DELETE ON {} \
         FOR EACH ROW EXECUTE FUNCTION {TRIGGER_FUNCTION}()",
        layout.version_table
    )
}

/// Human-readable name of a `pg_class.relkind`.
pub(crate) fn relkind_name(kind: &str) -> &'static str {
    match kind {
        "r" => "table",
        "p" => "partitioned table",
        "v" => "view",
        "m" => "materialized view",
        "i" | "I" => "index",
        "S" => "sequence",
        "f" => "foreign table",
        "c" => "composite type",
        "t" => "TOAST table",
        _ => "relation",
    }
}

pub(crate) fn is_table(kind: &str) -> bool {
    matches!(kind, "r" | "p")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_free_body_deletes_unconditionally() {
        let sql = trigger_function(HistoryMode::HistoryFree, &PrimaryLayout::default());
        assert!(sql.contains("DELETE FROM object_json WHERE object_id = OLD.zoid;"));
        assert!(!sql.contains("current_object"));
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION object_json_delete_on_state_delete()"));
    }

    #[test]
    fn history_preserving_body_checks_current_pointer() {
        let sql = trigger_function(HistoryMode::HistoryPreserving, &PrimaryLayout::default());
        assert!(sql.contains("SELECT tid INTO current_tid FROM current_object WHERE zoid = OLD.zoid;"));
        assert!(sql.contains("IF current_tid IS NULL OR current_tid = OLD.tid THEN"));
    }

    #[test]
    fn trigger_follows_primary_layout() {
        let layout = PrimaryLayout {
            version_table: SqlIdent::new("store.versions").unwrap(),
            current_table: SqlIdent::new("store.heads").unwrap(),
            object_id_column: SqlIdent::new("oid").unwrap(),
            version_column: SqlIdent::new("serial").unwrap(),
        };
        let body = trigger_function(HistoryMode::HistoryPreserving, &layout);
        assert!(body.contains("SELECT serial INTO current_tid FROM store.heads WHERE oid = OLD.oid;"));
        assert_eq!(
            create_trigger(&layout),
            "CREATE TRIGGER object_json_delete_on_state_delete_trigger AFTER DELETE ON \
             store.versions FOR EACH ROW EXECUTE FUNCTION object_json_delete_on_state_delete()"
        );
        assert!(drop_trigger(&layout).ends_with("ON store.versions"));
    }

    #[test]
    fn aux_statements_cover_staged_and_restored_ids() {
        let table = SqlIdent::new("by_type").unwrap();
        let delete = aux_delete(&table);
        assert!(delete.starts_with("DELETE FROM by_type WHERE object_id IN ("));
        assert!(delete.contains("SELECT object_id FROM temp_object_json_restored"));
        assert!(!delete.contains('$'));

        let insert = aux_insert(&table);
        assert!(insert.starts_with("INSERT INTO by_type (object_id)"));
        assert!(insert.contains("JOIN object_json USING (object_id)"));
    }

    #[test]
    fn lock_statement() {
        assert_eq!(
            lock_mirror("SHARE ROW EXCLUSIVE"),
            "LOCK TABLE object_json IN SHARE ROW EXCLUSIVE MODE"
        );
    }

    #[test]
    fn relkinds() {
        assert!(is_table("r"));
        assert!(is_table("p"));
        assert!(!is_table("v"));
        assert_eq!(relkind_name("v"), "view");
        assert_eq!(relkind_name("S"), "sequence");
        assert_eq!(relkind_name("?"), "relation");
    }
}
