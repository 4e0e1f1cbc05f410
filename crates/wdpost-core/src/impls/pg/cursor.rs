//! Postgres CursorStore: cursors as JSON text, leases as conditional upserts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{PgBackend, db_err, dt_to_ms};
use crate::domain::{EpochCursor, StoreError, WorkerId};
use crate::ports::CursorStore;

pub struct PgCursorStore {
    backend: Arc<PgBackend>,
}

impl PgCursorStore {
    pub fn new(backend: Arc<PgBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn load(&self, name: &str) -> Result<Option<EpochCursor>, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "SELECT cursor FROM {} WHERE name = $1",
            self.backend.table("wdpost_cursors")
        );
        let raw: Option<String> = sqlx::query_scalar(&sql)
            .bind(name)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err("load cursor"))?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| StoreError::Codec(format!("cursor {name}: {e}")))
        })
        .transpose()
    }

    async fn save(&self, name: &str, cursor: &EpochCursor) -> Result<(), StoreError> {
        self.backend.ensure_schema().await?;
        let raw = serde_json::to_string(cursor)
            .map_err(|e| StoreError::Codec(format!("cursor {name}: {e}")))?;
        let sql = format!(
            "INSERT INTO {} (name, cursor) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET cursor = EXCLUDED.cursor",
            self.backend.table("wdpost_cursors")
        );
        sqlx::query(&sql)
            .bind(name)
            .bind(raw)
            .execute(self.backend.pool())
            .await
            .map_err(db_err("save cursor"))?;
        Ok(())
    }

    async fn try_lead(
        &self,
        name: &str,
        owner: &WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.backend.ensure_schema().await?;
        let table = self.backend.table("wdpost_leases");
        let sql = format!(
            "INSERT INTO {table} AS l (name, owner, expires_at_ms) VALUES ($1, $2, $3)
             ON CONFLICT (name) DO UPDATE
               SET owner = EXCLUDED.owner, expires_at_ms = EXCLUDED.expires_at_ms
               WHERE l.owner = EXCLUDED.owner OR l.expires_at_ms <= $4"
        );
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let updated = sqlx::query(&sql)
            .bind(name)
            .bind(owner.as_str())
            .bind(dt_to_ms(expires_at))
            .bind(dt_to_ms(now))
            .execute(self.backend.pool())
            .await
            .map_err(db_err("take lease"))?
            .rows_affected();
        Ok(updated == 1)
    }
}
