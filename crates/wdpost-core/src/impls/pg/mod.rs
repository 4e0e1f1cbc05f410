//! PostgreSQL adapters (feature = "postgres").
//!
//! 3 つの store は 1 つの `PgBackend`（pool + schema 名）を共有する。
//! テーブルは最初の呼び出しで `CREATE ... IF NOT EXISTS` する。
//! 時刻は UTC のミリ秒 (BIGINT) で保存。

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::OnceCell;

use crate::domain::StoreError;

pub mod cursor;
pub mod outbox;
pub mod task_store;

pub use self::cursor::PgCursorStore;
pub use self::outbox::PgOutbox;
pub use self::task_store::PgTaskStore;

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Backend(format!("{context}: {e}"))
}

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Codec(format!("timestamp out of range: {ms}")))
}

pub(crate) fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Codec(format!("{what} {value} exceeds BIGINT")))
}

pub(crate) fn to_u64(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Codec(format!("negative {what}: {value}")))
}

/// Pool and schema shared by the Postgres stores.
pub struct PgBackend {
    pool: PgPool,
    schema: String,
    ready: OnceCell<()>,
}

impl PgBackend {
    /// Lazily connecting pool; nothing touches the database until first use.
    pub fn connect_lazy(database_url: &str) -> Result<Arc<Self>, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)
            .map_err(db_err("create pool"))?;
        Self::with_pool(pool, "public")
    }

    pub fn with_pool(pool: PgPool, schema: impl Into<String>) -> Result<Arc<Self>, StoreError> {
        let schema = schema.into();
        if !is_valid_schema_ident(&schema) {
            return Err(StoreError::Backend(format!("invalid schema name: {schema}")));
        }
        Ok(Arc::new(Self {
            pool,
            schema,
            ready: OnceCell::new(),
        }))
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `"schema".table`
    pub(crate) fn table(&self, name: &str) -> String {
        format!("\"{}\".{name}", self.schema)
    }

    pub(crate) async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.ready
            .get_or_try_init(|| async {
                let statements = [
                    format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema),
                    format!(
                        "CREATE TABLE IF NOT EXISTS {} (
                            id TEXT PRIMARY KEY,
                            task_type TEXT NOT NULL,
                            params TEXT NOT NULL,
                            dedupe_key TEXT NULL UNIQUE,
                            status TEXT NOT NULL,
                            owner TEXT NULL,
                            claimed_at_ms BIGINT NULL,
                            retries INTEGER NOT NULL DEFAULT 0,
                            last_error TEXT NULL,
                            not_before_ms BIGINT NULL,
                            created_at_ms BIGINT NOT NULL,
                            updated_at_ms BIGINT NOT NULL
                        )",
                        self.table("wdpost_tasks")
                    ),
                    format!(
                        "CREATE INDEX IF NOT EXISTS idx_wdpost_tasks_claimable
                         ON {}(task_type, status, created_at_ms)",
                        self.table("wdpost_tasks")
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS {} (
                            id TEXT PRIMARY KEY,
                            sender TEXT NOT NULL,
                            nonce BIGINT NULL,
                            payload BYTEA NOT NULL,
                            payload_hash TEXT NOT NULL,
                            dedupe_key TEXT NOT NULL,
                            state TEXT NOT NULL,
                            max_fee BIGINT NOT NULL,
                            retries INTEGER NOT NULL DEFAULT 0,
                            last_error TEXT NULL,
                            hold_until_ms BIGINT NOT NULL,
                            first_submitted_at_ms BIGINT NULL,
                            last_broadcast_at_ms BIGINT NULL,
                            confirmed_epoch BIGINT NULL,
                            created_at_ms BIGINT NOT NULL,
                            updated_at_ms BIGINT NOT NULL,
                            UNIQUE (sender, nonce)
                        )",
                        self.table("wdpost_outbox")
                    ),
                    format!(
                        "CREATE INDEX IF NOT EXISTS idx_wdpost_outbox_key
                         ON {}(dedupe_key, created_at_ms)",
                        self.table("wdpost_outbox")
                    ),
                    format!(
                        "CREATE INDEX IF NOT EXISTS idx_wdpost_outbox_state
                         ON {}(state, created_at_ms)",
                        self.table("wdpost_outbox")
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS {} (
                            name TEXT PRIMARY KEY,
                            cursor TEXT NOT NULL
                        )",
                        self.table("wdpost_cursors")
                    ),
                    format!(
                        "CREATE TABLE IF NOT EXISTS {} (
                            name TEXT PRIMARY KEY,
                            owner TEXT NOT NULL,
                            expires_at_ms BIGINT NOT NULL
                        )",
                        self.table("wdpost_leases")
                    ),
                ];
                for sql in &statements {
                    sqlx::query(sql)
                        .execute(&self.pool)
                        .await
                        .map_err(db_err("schema bootstrap"))?;
                }
                tracing::info!(schema = %self.schema, "postgres schema ready");
                Ok::<(), StoreError>(())
            })
            .await
            .map(|_| ())
    }
}

/// Backend on a fresh schema when `WDPOST_TEST_POSTGRES_URL` is set.
#[cfg(test)]
pub(crate) async fn test_backend(tag: &str) -> Option<Arc<PgBackend>> {
    let url = std::env::var("WDPOST_TEST_POSTGRES_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await
        .ok()?;
    let schema = format!("wdpost_test_{tag}_{}", ulid::Ulid::new().to_string().to_lowercase());
    PgBackend::with_pool(pool, schema).ok()
}
