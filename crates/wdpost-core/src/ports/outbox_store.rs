//! OutboxStore port - Outbox Message テーブル
//!
//! nonce の予約は sender 単位でアトミックに行う。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ChainEpoch, MessageId, NewOutboxMessage, OutboxMessage, StoreError};

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// New pending message without a nonce.
    async fn insert(
        &self,
        msg: NewOutboxMessage,
        now: DateTime<Utc>,
    ) -> Result<OutboxMessage, StoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError>;

    /// Most recently created message with this dedupe key, in any state.
    async fn latest_by_key(&self, dedupe_key: &str) -> Result<Option<OutboxMessage>, StoreError>;

    /// Reserves the next nonce for the message's sender:
    /// `max(highest reserved + 1, chain_next)`. Idempotent: a message that
    /// already holds a nonce gets it back unchanged.
    async fn assign_nonce(&self, id: MessageId, chain_next: u64) -> Result<u64, StoreError>;

    /// Records a successful broadcast (sets `first_submitted_at` once).
    async fn mark_sent(&self, id: MessageId, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Returns the new retry count.
    async fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    async fn mark_confirmed(
        &self,
        id: MessageId,
        epoch: ChainEpoch,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// No-op (false) on an already settled message.
    async fn mark_failed(
        &self,
        id: MessageId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Pending and sent messages, oldest first.
    async fn list_unsettled(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError>;
}
