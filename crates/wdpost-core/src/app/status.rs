//! Status - Task Record の件数ビュー

use tracing::info;

use crate::domain::StoreError;
use crate::ports::{TaskCounts, TaskStore};

/// Reads the counts and logs them as one `info!` line.
pub async fn report(store: &dyn TaskStore) -> Result<TaskCounts, StoreError> {
    let counts = store.counts().await?;
    info!(
        pending = counts.pending,
        running = counts.running,
        done = counts.done,
        failed = counts.failed,
        "task status"
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, TaskType, WorkerId};
    use crate::impls::MemoryTaskStore;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn counts_follow_task_lifecycle() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let tt = TaskType::new("test.echo.v1");
        let a = store.create(NewTask::new(tt.clone(), json!({})), now).await.unwrap().id();
        let b = store.create(NewTask::new(tt.clone(), json!({})), now).await.unwrap().id();
        store.create(NewTask::new(tt, json!({})), now).await.unwrap();

        let w = WorkerId::new("w");
        store.try_claim(a, &w, now, Duration::seconds(30)).await.unwrap();
        store.try_claim(b, &w, now, Duration::seconds(30)).await.unwrap();
        store.complete(a, &w, now).await.unwrap();

        let counts = report(&store).await.unwrap();
        assert_eq!(
            counts,
            TaskCounts { pending: 1, running: 1, done: 1, failed: 0 }
        );
    }
}
