//! Postgres OutboxStore.
//!
//! nonce の予約は sender ごとの advisory lock (トランザクション単位) の中で
//! 行い、`UNIQUE (sender, nonce)` を最後の砦にする。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::debug;

use super::{PgBackend, db_err, dt_to_ms, ms_to_dt, to_i64, to_u64};
use crate::domain::{
    Address, ChainEpoch, MessageId, MessageState, NewOutboxMessage, OutboxMessage, StoreError,
};
use crate::ports::{IdGenerator, OutboxStore, SystemClock, UlidGenerator};

const COLUMNS: &str = "id, sender, nonce, payload, payload_hash, dedupe_key, state, max_fee, \
                       retries, last_error, hold_until_ms, first_submitted_at_ms, \
                       last_broadcast_at_ms, confirmed_epoch, created_at_ms, updated_at_ms";

fn parse_id(raw: &str) -> Result<MessageId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Codec(format!("message id {raw}: {e}")))
}

fn decode(row: &PgRow) -> Result<OutboxMessage, StoreError> {
    let get = |e: sqlx::Error| StoreError::Codec(format!("outbox row: {e}"));
    let id: String = row.try_get("id").map_err(get)?;
    let state: String = row.try_get("state").map_err(get)?;
    let nonce: Option<i64> = row.try_get("nonce").map_err(get)?;
    let retries: i32 = row.try_get("retries").map_err(get)?;
    let first_submitted: Option<i64> = row.try_get("first_submitted_at_ms").map_err(get)?;
    let last_broadcast: Option<i64> = row.try_get("last_broadcast_at_ms").map_err(get)?;

    Ok(OutboxMessage {
        id: parse_id(&id)?,
        sender: Address::new(row.try_get::<String, _>("sender").map_err(get)?),
        nonce: nonce.map(|n| to_u64(n, "nonce")).transpose()?,
        payload: row.try_get("payload").map_err(get)?,
        payload_hash: row.try_get("payload_hash").map_err(get)?,
        dedupe_key: row.try_get("dedupe_key").map_err(get)?,
        state: MessageState::parse(&state)
            .ok_or_else(|| StoreError::Codec(format!("unknown message state {state}")))?,
        max_fee: to_u64(row.try_get("max_fee").map_err(get)?, "max_fee")?,
        retries: u32::try_from(retries).unwrap_or_default(),
        last_error: row.try_get("last_error").map_err(get)?,
        hold_until: ms_to_dt(row.try_get("hold_until_ms").map_err(get)?)?,
        first_submitted_at: first_submitted.map(ms_to_dt).transpose()?,
        last_broadcast_at: last_broadcast.map(ms_to_dt).transpose()?,
        confirmed_epoch: row.try_get::<Option<ChainEpoch>, _>("confirmed_epoch").map_err(get)?,
        created_at: ms_to_dt(row.try_get("created_at_ms").map_err(get)?)?,
        updated_at: ms_to_dt(row.try_get("updated_at_ms").map_err(get)?)?,
    })
}

pub struct PgOutbox {
    backend: Arc<PgBackend>,
    ids: Box<dyn IdGenerator>,
}

impl PgOutbox {
    pub fn new(backend: Arc<PgBackend>) -> Self {
        Self {
            backend,
            ids: Box::new(UlidGenerator::new(SystemClock)),
        }
    }

    fn table(&self) -> String {
        self.backend.table("wdpost_outbox")
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        bind: &str,
        context: &'static str,
    ) -> Result<Option<OutboxMessage>, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE {clause}", self.table());
        let row = sqlx::query(&sql)
            .bind(bind)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err(context))?;
        row.as_ref().map(decode).transpose()
    }
}

#[async_trait]
impl OutboxStore for PgOutbox {
    async fn insert(
        &self,
        msg: NewOutboxMessage,
        now: DateTime<Utc>,
    ) -> Result<OutboxMessage, StoreError> {
        self.backend.ensure_schema().await?;
        let message = OutboxMessage::new(self.ids.message_id(), msg, now);
        let sql = format!(
            "INSERT INTO {} (id, sender, nonce, payload, payload_hash, dedupe_key, state, max_fee,
                             retries, hold_until_ms, created_at_ms, updated_at_ms)
             VALUES ($1, $2, NULL, $3, $4, $5, $6, $7, 0, $8, $9, $9)",
            self.table()
        );
        sqlx::query(&sql)
            .bind(message.id.to_string())
            .bind(message.sender.as_str())
            .bind(&message.payload)
            .bind(&message.payload_hash)
            .bind(&message.dedupe_key)
            .bind(message.state.as_str())
            .bind(to_i64(message.max_fee, "max_fee")?)
            .bind(dt_to_ms(message.hold_until))
            .bind(dt_to_ms(now))
            .execute(self.backend.pool())
            .await
            .map_err(db_err("insert message"))?;
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        self.fetch_one_where("id = $1", &id.to_string(), "get message")
            .await
    }

    async fn latest_by_key(&self, dedupe_key: &str) -> Result<Option<OutboxMessage>, StoreError> {
        self.fetch_one_where(
            "dedupe_key = $1 ORDER BY created_at_ms DESC, id DESC LIMIT 1",
            dedupe_key,
            "latest by key",
        )
        .await
    }

    async fn assign_nonce(&self, id: MessageId, chain_next: u64) -> Result<u64, StoreError> {
        self.backend.ensure_schema().await?;
        let table = self.table();
        let mut tx = self
            .backend
            .pool()
            .begin()
            .await
            .map_err(db_err("begin nonce tx"))?;

        let row = sqlx::query(&format!(
            "SELECT sender, nonce FROM {table} WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("lock message"))?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let sender: String = row.try_get("sender").map_err(db_err("message row"))?;
        let held: Option<i64> = row.try_get("nonce").map_err(db_err("message row"))?;
        if let Some(nonce) = held {
            return to_u64(nonce, "nonce");
        }

        // serializes reservations per sender until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&sender)
            .execute(&mut *tx)
            .await
            .map_err(db_err("advisory lock"))?;

        let highest: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(nonce) FROM {table} WHERE sender = $1"
        ))
        .bind(&sender)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("highest nonce"))?;
        let highest = highest.map(|h| to_u64(h, "nonce")).transpose()?;
        let nonce = highest.map_or(chain_next, |h| chain_next.max(h + 1));

        sqlx::query(&format!("UPDATE {table} SET nonce = $2 WHERE id = $1"))
            .bind(id.to_string())
            .bind(to_i64(nonce, "nonce")?)
            .execute(&mut *tx)
            .await
            .map_err(db_err("assign nonce"))?;
        tx.commit().await.map_err(db_err("commit nonce tx"))?;
        debug!(message_id = %id, sender = %sender, nonce, "nonce reserved");
        Ok(nonce)
    }

    async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "UPDATE {} SET state = 'sent',
                 first_submitted_at_ms = COALESCE(first_submitted_at_ms, $2),
                 last_broadcast_at_ms = $2, updated_at_ms = $2
             WHERE id = $1 AND state IN ('pending', 'sent')",
            self.table()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(dt_to_ms(now))
            .execute(self.backend.pool())
            .await
            .map_err(db_err("mark sent"))?;
        Ok(())
    }

    async fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "UPDATE {} SET retries = retries + 1, last_error = $2,
                 last_broadcast_at_ms = $3, updated_at_ms = $3
             WHERE id = $1 RETURNING retries",
            self.table()
        );
        let retries: Option<i32> = sqlx::query_scalar(&sql)
            .bind(id.to_string())
            .bind(error)
            .bind(dt_to_ms(now))
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err("record failure"))?;
        let retries = retries.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(u32::try_from(retries).unwrap_or_default())
    }

    async fn mark_confirmed(
        &self,
        id: MessageId,
        epoch: ChainEpoch,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "UPDATE {} SET state = 'confirmed', confirmed_epoch = $2, updated_at_ms = $3
             WHERE id = $1",
            self.table()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(epoch)
            .bind(dt_to_ms(now))
            .execute(self.backend.pool())
            .await
            .map_err(db_err("mark confirmed"))?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "UPDATE {} SET state = 'failed', last_error = $2, updated_at_ms = $3
             WHERE id = $1 AND state IN ('pending', 'sent')",
            self.table()
        );
        let updated = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(reason)
            .bind(dt_to_ms(now))
            .execute(self.backend.pool())
            .await
            .map_err(db_err("mark failed"))?
            .rows_affected();
        Ok(updated == 1)
    }

    async fn list_unsettled(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE state IN ('pending', 'sent')
             ORDER BY created_at_ms ASC, id ASC LIMIT $1",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err("list unsettled"))?;
        rows.iter().map(decode).collect()
    }
}
