//! In-memory TaskStore.
//!
//! 1 つの Mutex の中で判定と更新を行うので、claim の条件付き更新は
//! DB の `UPDATE ... WHERE` と同じ意味になる。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    Enqueued, NewTask, StoreError, TaskId, TaskRecord, TaskStatus, TaskType, WorkerId,
};
use crate::ports::{IdGenerator, SystemClock, TaskCounts, TaskStore, UlidGenerator};

#[derive(Default)]
struct MemoryTaskState {
    records: HashMap<TaskId, TaskRecord>,
    by_dedupe_key: HashMap<String, TaskId>,
}

impl MemoryTaskState {
    /// Applies `f` only when `owner` still owns the task.
    fn with_owned(
        &mut self,
        id: TaskId,
        owner: &WorkerId,
        f: impl FnOnce(&mut TaskRecord),
    ) -> bool {
        match self.records.get_mut(&id) {
            Some(record) if record.is_owned_by(owner) => {
                f(record);
                true
            }
            _ => false,
        }
    }
}

pub struct MemoryTaskStore {
    state: Mutex<MemoryTaskState>,
    ids: Box<dyn IdGenerator>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::with_id_generator(UlidGenerator::new(SystemClock))
    }

    pub fn with_id_generator(ids: impl IdGenerator + 'static) -> Self {
        Self {
            state: Mutex::new(MemoryTaskState::default()),
            ids: Box::new(ids),
        }
    }

    /// Every record, oldest first. For tests and status dumps.
    pub async fn snapshot(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<TaskRecord> = state.records.values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: NewTask, now: DateTime<Utc>) -> Result<Enqueued, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(key) = &task.dedupe_key
            && let Some(existing) = state.by_dedupe_key.get(key)
        {
            return Ok(Enqueued::Existing(*existing));
        }

        let id = self.ids.task_id();
        if let Some(key) = &task.dedupe_key {
            state.by_dedupe_key.insert(key.clone(), id);
        }
        state.records.insert(id, TaskRecord::new(id, task, now));
        Ok(Enqueued::Created(id))
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn list_claimable(
        &self,
        task_type: &TaskType,
        now: DateTime<Utc>,
        liveness: Duration,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut candidates: Vec<TaskRecord> = state
            .records
            .values()
            .filter(|r| &r.task_type == task_type && r.is_claimable(now, liveness))
            .cloned()
            .collect();
        candidates.sort_by_key(|r| (r.created_at, r.id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn try_claim(
        &self,
        id: TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(&id) {
            Some(record) if record.is_claimable(now, liveness) => {
                record.claim(owner, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(
        &self,
        id: TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.with_owned(id, owner, |r| {
            r.claimed_at = Some(now);
            r.updated_at = now;
        }))
    }

    async fn complete(
        &self,
        id: TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.with_owned(id, owner, |r| r.mark_done(now)))
    }

    async fn retry_later(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.with_owned(id, owner, |r| {
            r.schedule_retry(error.to_string(), not_before, now)
        }))
    }

    async fn fail(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.with_owned(id, owner, |r| r.mark_failed(error.to_string(), now)))
    }

    async fn counts(&self) -> Result<TaskCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = TaskCounts::default();
        for record in state.records.values() {
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn liveness() -> Duration {
        Duration::seconds(30)
    }

    fn task() -> NewTask {
        NewTask::new(TaskType::new("test.echo.v1"), json!({ "value": 1 }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_exactly_one_winner() {
        let store = Arc::new(MemoryTaskStore::new());
        let id = store.create(task(), t0()).await.unwrap().id();

        let mut joins = Vec::new();
        for n in 0..16 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                let worker = WorkerId::new(format!("w{n}"));
                store.try_claim(id, &worker, t0(), liveness()).await.unwrap()
            }));
        }

        let mut winners = 0;
        for j in joins {
            if j.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn stale_claim_is_taken_over_and_old_owner_is_fenced() {
        let store = MemoryTaskStore::new();
        let id = store.create(task(), t0()).await.unwrap().id();
        let a = WorkerId::new("a");
        let b = WorkerId::new("b");

        assert!(store.try_claim(id, &a, t0(), liveness()).await.unwrap());
        let later = t0() + Duration::seconds(10);
        assert!(!store.try_claim(id, &b, later, liveness()).await.unwrap());

        // a stops heartbeating
        let expired = t0() + Duration::seconds(31);
        assert!(store.try_claim(id, &b, expired, liveness()).await.unwrap());

        assert!(!store.complete(id, &a, expired).await.unwrap());
        assert!(!store.heartbeat(id, &a, expired).await.unwrap());
        assert!(store.complete(id, &b, expired).await.unwrap());

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn heartbeat_keeps_the_claim_alive() {
        let store = MemoryTaskStore::new();
        let id = store.create(task(), t0()).await.unwrap().id();
        let a = WorkerId::new("a");

        store.try_claim(id, &a, t0(), liveness()).await.unwrap();
        let t20 = t0() + Duration::seconds(20);
        assert!(store.heartbeat(id, &a, t20).await.unwrap());

        let t45 = t0() + Duration::seconds(45);
        let claimable = store
            .list_claimable(&TaskType::new("test.echo.v1"), t45, liveness(), 10)
            .await
            .unwrap();
        assert!(claimable.is_empty());
    }

    #[tokio::test]
    async fn dedupe_key_returns_existing_task() {
        let store = MemoryTaskStore::new();
        let first = store
            .create(task().with_dedupe_key("k1"), t0())
            .await
            .unwrap();
        let second = store
            .create(task().with_dedupe_key("k1"), t0())
            .await
            .unwrap();

        assert!(matches!(first, Enqueued::Created(_)));
        assert_eq!(second, Enqueued::Existing(first.id()));
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn retry_later_hides_task_until_not_before() {
        let store = MemoryTaskStore::new();
        let tt = TaskType::new("test.echo.v1");
        let id = store.create(task(), t0()).await.unwrap().id();
        let a = WorkerId::new("a");

        store.try_claim(id, &a, t0(), liveness()).await.unwrap();
        let retry_at = t0() + Duration::seconds(8);
        assert!(store.retry_later(id, &a, "boom", retry_at, t0()).await.unwrap());

        let early = store
            .list_claimable(&tt, t0() + Duration::seconds(7), liveness(), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        let ready = store.list_claimable(&tt, retry_at, liveness(), 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].retries, 1);
        assert_eq!(ready[0].last_error.as_deref(), Some("boom"));
    }
}
