//! Postgres TaskStore.
//!
//! claim / heartbeat / complete / retry / fail はすべて 1 文の条件付き
//! UPDATE。成否は rows_affected で判定する。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::{PgBackend, db_err, dt_to_ms, ms_to_dt};
use crate::domain::{
    Enqueued, NewTask, StoreError, TaskId, TaskRecord, TaskStatus, TaskType, WorkerId,
};
use crate::ports::{IdGenerator, SystemClock, TaskCounts, TaskStore, UlidGenerator};

const COLUMNS: &str = "id, task_type, params, dedupe_key, status, owner, claimed_at_ms, \
                       retries, last_error, not_before_ms, created_at_ms, updated_at_ms";

/// Same predicate as `TaskRecord::is_claimable`; `$now` and `$liveness`
/// are bound as milliseconds.
fn claimable(now: &str, liveness: &str) -> String {
    format!(
        "((status = 'pending' AND (not_before_ms IS NULL OR not_before_ms <= {now}))
          OR (status = 'running' AND (claimed_at_ms IS NULL OR claimed_at_ms + {liveness} < {now})))"
    )
}

fn parse_id(raw: &str) -> Result<TaskId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Codec(format!("task id {raw}: {e}")))
}

fn decode(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let get = |e: sqlx::Error| StoreError::Codec(format!("task row: {e}"));
    let id: String = row.try_get("id").map_err(get)?;
    let params: String = row.try_get("params").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let owner: Option<String> = row.try_get("owner").map_err(get)?;
    let claimed_at: Option<i64> = row.try_get("claimed_at_ms").map_err(get)?;
    let retries: i32 = row.try_get("retries").map_err(get)?;
    let not_before: Option<i64> = row.try_get("not_before_ms").map_err(get)?;

    Ok(TaskRecord {
        id: parse_id(&id)?,
        task_type: TaskType::new(row.try_get::<String, _>("task_type").map_err(get)?),
        params: serde_json::from_str(&params)
            .map_err(|e| StoreError::Codec(format!("params of {id}: {e}")))?,
        dedupe_key: row.try_get("dedupe_key").map_err(get)?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| StoreError::Codec(format!("unknown task status {status}")))?,
        owner: owner.map(WorkerId::new),
        claimed_at: claimed_at.map(ms_to_dt).transpose()?,
        retries: u32::try_from(retries).unwrap_or_default(),
        last_error: row.try_get("last_error").map_err(get)?,
        not_before: not_before.map(ms_to_dt).transpose()?,
        created_at: ms_to_dt(row.try_get("created_at_ms").map_err(get)?)?,
        updated_at: ms_to_dt(row.try_get("updated_at_ms").map_err(get)?)?,
    })
}

pub struct PgTaskStore {
    backend: Arc<PgBackend>,
    ids: Box<dyn IdGenerator>,
}

impl PgTaskStore {
    pub fn new(backend: Arc<PgBackend>) -> Self {
        Self {
            backend,
            ids: Box::new(UlidGenerator::new(SystemClock)),
        }
    }

    /// Runs an owner-fenced UPDATE; true when the row was still ours.
    async fn fenced(
        &self,
        set: &str,
        id: TaskId,
        owner: &WorkerId,
        bind: impl FnOnce(
            sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        context: &'static str,
    ) -> Result<bool, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "UPDATE {} SET {set} WHERE id = $1 AND status = 'running' AND owner = $2",
            self.backend.table("wdpost_tasks")
        );
        let query = sqlx::query(&sql).bind(id.to_string()).bind(owner.as_str());
        let updated = bind(query)
            .execute(self.backend.pool())
            .await
            .map_err(db_err(context))?
            .rows_affected();
        Ok(updated == 1)
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, task: NewTask, now: DateTime<Utc>) -> Result<Enqueued, StoreError> {
        self.backend.ensure_schema().await?;
        let table = self.backend.table("wdpost_tasks");
        let id = self.ids.task_id();
        let params = serde_json::to_string(&task.params)
            .map_err(|e| StoreError::Codec(format!("params: {e}")))?;

        let sql = format!(
            "INSERT INTO {table} (id, task_type, params, dedupe_key, status, retries, created_at_ms, updated_at_ms)
             VALUES ($1, $2, $3, $4, 'pending', 0, $5, $5)
             ON CONFLICT (dedupe_key) DO NOTHING
             RETURNING id"
        );
        let inserted: Option<String> = sqlx::query_scalar(&sql)
            .bind(id.to_string())
            .bind(task.task_type.as_str())
            .bind(&params)
            .bind(task.dedupe_key.as_deref())
            .bind(dt_to_ms(now))
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err("insert task"))?;
        if inserted.is_some() {
            return Ok(Enqueued::Created(id));
        }

        // only a dedupe key conflict suppresses the insert
        let existing: String = sqlx::query_scalar(&format!(
            "SELECT id FROM {table} WHERE dedupe_key = $1"
        ))
        .bind(task.dedupe_key.as_deref())
        .fetch_one(self.backend.pool())
        .await
        .map_err(db_err("lookup dedupe key"))?;
        Ok(Enqueued::Existing(parse_id(&existing)?))
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1",
            self.backend.table("wdpost_tasks")
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err("get task"))?;
        row.as_ref().map(decode).transpose()
    }

    async fn list_claimable(
        &self,
        task_type: &TaskType,
        now: DateTime<Utc>,
        liveness: Duration,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE task_type = $1 AND {}
             ORDER BY created_at_ms ASC, id ASC LIMIT $4",
            self.backend.table("wdpost_tasks"),
            claimable("$2", "$3")
        );
        let rows = sqlx::query(&sql)
            .bind(task_type.as_str())
            .bind(dt_to_ms(now))
            .bind(liveness.num_milliseconds())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err("list claimable"))?;
        rows.iter().map(decode).collect()
    }

    async fn try_claim(
        &self,
        id: TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> Result<bool, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "UPDATE {} SET status = 'running', owner = $2, claimed_at_ms = $3, updated_at_ms = $3
             WHERE id = $1 AND {}",
            self.backend.table("wdpost_tasks"),
            claimable("$3", "$4")
        );
        let updated = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(owner.as_str())
            .bind(dt_to_ms(now))
            .bind(liveness.num_milliseconds())
            .execute(self.backend.pool())
            .await
            .map_err(db_err("claim task"))?
            .rows_affected();
        Ok(updated == 1)
    }

    async fn heartbeat(
        &self,
        id: TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = dt_to_ms(now);
        self.fenced(
            "claimed_at_ms = $3, updated_at_ms = $3",
            id,
            owner,
            |q| q.bind(now),
            "heartbeat",
        )
        .await
    }

    async fn complete(
        &self,
        id: TaskId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = dt_to_ms(now);
        self.fenced(
            "status = 'done', owner = NULL, updated_at_ms = $3",
            id,
            owner,
            |q| q.bind(now),
            "complete task",
        )
        .await
    }

    async fn retry_later(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = dt_to_ms(now);
        let not_before = dt_to_ms(not_before);
        let error = error.to_string();
        self.fenced(
            "status = 'pending', owner = NULL, claimed_at_ms = NULL, retries = retries + 1,
             last_error = $3, not_before_ms = $4, updated_at_ms = $5",
            id,
            owner,
            |q| q.bind(error).bind(not_before).bind(now),
            "retry task",
        )
        .await
    }

    async fn fail(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = dt_to_ms(now);
        let error = error.to_string();
        self.fenced(
            "status = 'failed', owner = NULL, last_error = $3, updated_at_ms = $4",
            id,
            owner,
            |q| q.bind(error).bind(now),
            "fail task",
        )
        .await
    }

    async fn counts(&self) -> Result<TaskCounts, StoreError> {
        self.backend.ensure_schema().await?;
        let sql = format!(
            "SELECT status, COUNT(*) AS n FROM {} GROUP BY status",
            self.backend.table("wdpost_tasks")
        );
        let rows = sqlx::query(&sql)
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err("count tasks"))?;

        let mut counts = TaskCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(db_err("count row"))?;
            let n: i64 = row.try_get("n").map_err(db_err("count row"))?;
            let n = usize::try_from(n).unwrap_or_default();
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => counts.pending = n,
                Some(TaskStatus::Running) => counts.running = n,
                Some(TaskStatus::Done) => counts.done = n,
                Some(TaskStatus::Failed) => counts.failed = n,
                None => {}
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::pg::test_backend;
    use serde_json::json;

    #[tokio::test]
    async fn claim_is_exclusive_and_fenced_when_env_is_set() {
        let Some(backend) = test_backend("tasks").await else {
            return;
        };
        let store = Arc::new(PgTaskStore::new(backend));
        let now = Utc::now();
        let liveness = Duration::seconds(30);
        let id = store
            .create(NewTask::new(TaskType::new("t"), json!({"n": 1})), now)
            .await
            .unwrap()
            .id();

        let mut joins = Vec::new();
        for n in 0..8 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                store
                    .try_claim(id, &WorkerId::new(format!("w{n}")), now, liveness)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for j in joins {
            if j.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let record = store.get(id).await.unwrap().unwrap();
        let owner = record.owner.unwrap();
        assert!(!store.complete(id, &WorkerId::new("stranger"), now).await.unwrap());
        assert!(store.complete(id, &owner, now).await.unwrap());
        assert_eq!(store.counts().await.unwrap().done, 1);
    }

    #[tokio::test]
    async fn dedupe_key_returns_existing_when_env_is_set() {
        let Some(backend) = test_backend("dedupe").await else {
            return;
        };
        let store = PgTaskStore::new(backend);
        let now = Utc::now();
        let task = NewTask::new(TaskType::new("t"), json!({})).with_dedupe_key("k");

        let first = store.create(task.clone(), now).await.unwrap();
        let second = store.create(task, now).await.unwrap();
        assert!(matches!(first, Enqueued::Created(_)));
        assert_eq!(second, Enqueued::Existing(first.id()));
    }
}
