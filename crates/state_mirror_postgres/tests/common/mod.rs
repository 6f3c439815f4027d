//! Isolated test database with a minimal primary object store.
//!
//! Each test creates a temporary database via CREATE DATABASE, installs the
//! primary store's version relations into it, and drops it on cleanup.

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool};

use state_mirror_core::{MirrorConfig, StoreExtension};
use state_mirror_postgres::{PgMirrorCoordinator, PgMirrorStore};

const HISTORY_FREE_DDL: &str = r#"
    CREATE TABLE object_state (
        zoid  bigint PRIMARY KEY,
        tid   bigint NOT NULL,
        state bytea
    );
"#;

const HISTORY_PRESERVING_DDL: &str = r#"
    CREATE TABLE object_state (
        zoid  bigint NOT NULL,
        tid   bigint NOT NULL,
        state bytea,
        PRIMARY KEY (zoid, tid)
    );
    CREATE TABLE current_object (
        zoid bigint PRIMARY KEY,
        tid  bigint NOT NULL
    );
"#;

pub struct TestDb {
    pub pool: PgPool,
    pub dbname: String,
    pub keep_history: bool,
    admin: PgPool,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl TestDb {
    /// Create an isolated database holding the primary store's relations.
    pub async fn new(keep_history: bool) -> Self {
        init_tracing();
        let admin_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
        let dbname = format!("state_mirror_test_{}", uuid::Uuid::new_v4().simple());

        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(PgConnectOptions::from_str(&admin_url).expect("DATABASE_URL parse failed"))
            .await
            .expect("admin connect failed");

        sqlx::query(&format!(r#"CREATE DATABASE "{}""#, dbname))
            .execute(&admin)
            .await
            .expect("CREATE DATABASE failed");

        let test_opts = PgConnectOptions::from_str(&admin_url)
            .expect("DATABASE_URL parse failed")
            .database(&dbname);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(test_opts)
            .await
            .expect("test db connect failed");

        let ddl = if keep_history {
            HISTORY_PRESERVING_DDL
        } else {
            HISTORY_FREE_DDL
        };
        sqlx::raw_sql(ddl)
            .execute(&pool)
            .await
            .expect("primary store DDL failed");

        Self {
            pool,
            dbname,
            keep_history,
            admin,
        }
    }

    /// Coordinator over this database with its mirror schema ensured.
    pub async fn mirror(&self, config: MirrorConfig) -> PgMirrorCoordinator {
        let store = Arc::new(PgMirrorStore::from_config(&config));
        let mirror = PgMirrorCoordinator::new(store, config).expect("mirror config");
        let mut conn = self.pool.acquire().await.expect("acquire");
        mirror
            .on_schema_update(&mut *conn)
            .await
            .expect("ensure mirror schema");
        mirror
    }

    /// Auxiliary table keyed by mirror object id.
    pub async fn create_aux_table(&self, name: &str) {
        sqlx::query(&format!(
            "CREATE TABLE {name} (object_id bigint PRIMARY KEY \
             REFERENCES object_json (object_id) ON DELETE CASCADE)"
        ))
        .execute(&self.pool)
        .await
        .expect("create aux table");
    }

    pub async fn aux_ids(&self, name: &str) -> Vec<i64> {
        sqlx::query_scalar(&format!("SELECT object_id FROM {name} ORDER BY object_id"))
            .fetch_all(&self.pool)
            .await
            .expect("read aux table")
    }

    pub async fn mirror_state(&self, object_id: i64) -> Option<serde_json::Value> {
        sqlx::query_scalar("SELECT state FROM object_json WHERE object_id = $1")
            .bind(object_id)
            .fetch_optional(&self.pool)
            .await
            .expect("read mirror")
    }

    pub async fn mirror_ids(&self) -> Vec<i64> {
        sqlx::query_scalar("SELECT object_id FROM object_json ORDER BY object_id")
            .fetch_all(&self.pool)
            .await
            .expect("read mirror")
    }

    /// Physically delete one version, as pack or GC would.
    pub async fn delete_version(&self, zoid: i64, tid: i64) {
        sqlx::query("DELETE FROM object_state WHERE zoid = $1 AND tid = $2")
            .bind(zoid)
            .bind(tid)
            .execute(&self.pool)
            .await
            .expect("delete version");
    }

    pub async fn cleanup(self) {
        self.pool.close().await;
        let drop_sql = format!(r#"DROP DATABASE IF EXISTS "{}" WITH (FORCE)"#, self.dbname);
        let _ = sqlx::query(&drop_sql).execute(&self.admin).await;
        self.admin.close().await;
    }
}

/// Store a version the way the primary store does inside its transaction.
pub async fn store_version(
    conn: &mut PgConnection,
    keep_history: bool,
    zoid: i64,
    tid: i64,
    payload: &[u8],
) {
    if keep_history {
        sqlx::query("INSERT INTO object_state (zoid, tid, state) VALUES ($1, $2, $3)")
            .bind(zoid)
            .bind(tid)
            .bind(payload)
            .execute(&mut *conn)
            .await
            .expect("insert version");
        sqlx::query(
            "INSERT INTO current_object (zoid, tid) VALUES ($1, $2) \
             ON CONFLICT (zoid) DO UPDATE SET tid = EXCLUDED.tid",
        )
        .bind(zoid)
        .bind(tid)
        .execute(&mut *conn)
        .await
        .expect("move current pointer");
    } else {
        sqlx::query(
            "INSERT INTO object_state (zoid, tid, state) VALUES ($1, $2, $3) \
             ON CONFLICT (zoid) DO UPDATE SET tid = EXCLUDED.tid, state = EXCLUDED.state",
        )
        .bind(zoid)
        .bind(tid)
        .bind(payload)
        .execute(&mut *conn)
        .await
        .expect("upsert version");
    }
}
