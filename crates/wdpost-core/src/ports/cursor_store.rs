//! CursorStore port - Chain Epoch Cursor の永続化と scheduler のリーダー権
//!
//! 同じ chain-head ストリームで epoch を発火するプロセスは 1 つだけ。
//! リーダー権は期限付きの名前付きリースで、条件付き更新で取得する。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{EpochCursor, StoreError, WorkerId};

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<EpochCursor>, StoreError>;

    async fn save(&self, name: &str, cursor: &EpochCursor) -> Result<(), StoreError>;

    /// Acquires or renews the lease `name` for `owner`. Succeeds when the
    /// lease is free, expired, or already held by `owner`.
    async fn try_lead(
        &self,
        name: &str,
        owner: &WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}
