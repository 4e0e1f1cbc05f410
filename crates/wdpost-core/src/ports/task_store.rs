//! TaskStore port - Task Record の正本（source of truth）
//!
//! 全 worker は同じ TaskStore を共有し、所有権は条件付き更新でのみ取得する。
//! 長時間のロックは取らない（楽観的）。
//!
//! # 実装
//! - `impls::MemoryTaskStore`: 単一プロセス / テスト用
//! - `impls::pg::PgTaskStore`: PostgreSQL（feature = "postgres"）

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Enqueued, NewTask, StoreError, TaskId, TaskRecord, TaskType, WorkerId};

/// Task counts by status, for status views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

/// # 不変条件
/// - `try_claim` は `TaskRecord::is_claimable` が真のときだけ成功し、
///   同時に走った他の claim は必ず負ける（first writer wins）
/// - `heartbeat` / `complete` / `retry_later` / `fail` は呼び出し元がまだ
///   owner のときだけ反映される（false = claim を失っていた）
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates a pending task. With a dedupe key that already exists, the
    /// existing task is returned untouched.
    async fn create(&self, task: NewTask, now: DateTime<Utc>) -> Result<Enqueued, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Candidates for `try_claim`, oldest first. Reading a candidate grants
    /// nothing.
    async fn list_claimable(
        &self,
        task_type: &TaskType,
        now: DateTime<Utc>,
        liveness: Duration,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Atomic compare-and-set of the owner.
    async fn try_claim(
        &self,
        id: TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> Result<bool, StoreError>;

    async fn heartbeat(
        &self,
        id: TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn complete(
        &self,
        id: TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Back to pending with `retries + 1`, claimable again from `not_before`.
    async fn retry_later(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn fail(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn counts(&self) -> Result<TaskCounts, StoreError>;
}
