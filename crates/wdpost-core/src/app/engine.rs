//! TaskEngine - fleet 共有の Task Record を claim して実行するループ
//!
//! # フロー（1 tick）
//! 1. task_type ごとに空き permit 数だけ `list_claimable`
//! 2. `try_claim`（条件付き更新）に勝ったものだけ実行
//! 3. 実行中は heartbeat で claim を延長（拒否されたら handler を捨てる）
//! 4. 結果を owner 条件付きで反映: done / retry_later / failed + alert
//!
//! worker 同士は直接通信しない。所有権の判定は TaskStore だけが行う。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use crate::domain::{
    Alert, AlertKind, StoreError, TaskError, TaskId, TaskRecord, TaskType, WorkerId,
};
use crate::ports::{AlertSink, Clock, TaskCounts, TaskStore, after, to_chrono};
use crate::typed::{DynHandler, TaskContext, TypedRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// A running claim older than this is presumed dead. Must exceed the
    /// heartbeat interval.
    pub liveness_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Retryable failures allowed before the task fails for good.
    pub max_retries: u32,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(20),
            max_retries: 5,
            retry: RetryPolicy::default(),
        }
    }
}

struct Entry {
    task_type: TaskType,
    handler: Arc<dyn DynHandler>,
    permits: Arc<Semaphore>,
}

/// State shared with spawned executions.
struct Shared {
    worker: WorkerId,
    store: Arc<dyn TaskStore>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

pub struct TaskEngine {
    shared: Arc<Shared>,
    entries: Vec<Entry>,
    inflight: Mutex<JoinSet<()>>,
}

impl TaskEngine {
    pub(crate) fn new(
        worker: WorkerId,
        store: Arc<dyn TaskStore>,
        registry: TypedRegistry,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let mut entries: Vec<Entry> = registry
            .iter()
            .map(|(task_type, reg)| Entry {
                task_type: TaskType::new(task_type),
                handler: Arc::clone(&reg.handler),
                permits: Arc::new(Semaphore::new(reg.max_concurrent)),
            })
            .collect();
        entries.sort_by(|a, b| a.task_type.as_str().cmp(b.task_type.as_str()));

        Self {
            shared: Arc::new(Shared {
                worker,
                store,
                alerts,
                clock,
                config,
            }),
            entries,
            inflight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.shared.worker
    }

    pub fn task_types(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.task_type.as_str()).collect()
    }

    pub async fn counts(&self) -> Result<TaskCounts, StoreError> {
        self.shared.store.counts().await
    }

    /// One poll tick. Returns the number of tasks claimed and started.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let shared = &self.shared;
        let liveness = to_chrono(shared.config.liveness_timeout);
        let mut started = 0;

        for entry in &self.entries {
            let free = entry.permits.available_permits();
            if free == 0 {
                continue;
            }

            let now = shared.clock.now();
            let candidates = shared
                .store
                .list_claimable(&entry.task_type, now, liveness, free)
                .await?;

            for record in candidates {
                let Ok(permit) = Arc::clone(&entry.permits).try_acquire_owned() else {
                    break;
                };
                let now = shared.clock.now();
                if !shared
                    .store
                    .try_claim(record.id, &shared.worker, now, liveness)
                    .await?
                {
                    // another worker won the race
                    debug!(task_id = %record.id, "claim lost");
                    continue;
                }

                started += 1;
                let shared = Arc::clone(shared);
                let handler = Arc::clone(&entry.handler);
                self.inflight
                    .lock()
                    .await
                    .spawn(execute(shared, handler, record, permit));
            }
        }

        self.reap_finished().await;
        Ok(started)
    }

    /// Waits for every started execution to finish.
    pub async fn wait_idle(&self) {
        let mut inflight = self.inflight.lock().await;
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task execution panicked");
            }
        }
    }

    async fn reap_finished(&self) {
        let mut inflight = self.inflight.lock().await;
        while let Some(joined) = inflight.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "task execution panicked");
            }
        }
    }

    /// Polls until `shutdown` flips to true, then lets in-flight handlers
    /// finish. A store error stops the engine.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        info!(
            worker = %self.shared.worker,
            task_types = ?self.task_types(),
            "instance handles tasks"
        );

        let mut ticker = tokio::time::interval(self.shared.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "task store unavailable, stopping engine");
                        break Err(e);
                    }
                }
            }
        };

        // handlers are not preemptible: wait for them, but claim nothing new
        self.wait_idle().await;
        info!(worker = %self.shared.worker, "engine stopped");
        result
    }
}

async fn execute(
    shared: Arc<Shared>,
    handler: Arc<dyn DynHandler>,
    record: TaskRecord,
    _permit: OwnedSemaphorePermit,
) {
    let ctx = TaskContext {
        task_id: record.id,
        worker: shared.worker.clone(),
        retries: record.retries,
    };
    info!(
        task_id = %record.id,
        task_type = %record.task_type,
        worker = %shared.worker,
        retries = record.retries,
        "executing task"
    );

    // the heartbeat only ends when the claim is lost; the handler goes with it
    let mut heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&shared), record.id));
    let result = tokio::select! {
        result = handler.handle_dyn(record.params.clone(), &ctx) => result,
        _ = &mut heartbeat => {
            warn!(
                task_id = %record.id,
                task_type = %record.task_type,
                worker = %shared.worker,
                "claim lost, dropping handler"
            );
            return;
        }
    };
    heartbeat.abort();

    let now = shared.clock.now();
    let settled = match result {
        Ok(()) => shared
            .store
            .complete(record.id, &shared.worker, now)
            .await
            .map(|owned| {
                if owned {
                    info!(task_id = %record.id, task_type = %record.task_type, "task done");
                }
                owned
            }),
        Err(err) => settle_failure(&shared, handler.as_ref(), &record, err).await,
    };

    match settled {
        Ok(true) => {}
        Ok(false) => warn!(
            task_id = %record.id,
            worker = %shared.worker,
            "claim was taken over before the result was recorded"
        ),
        Err(e) => error!(task_id = %record.id, error = %e, "recording task result failed"),
    }
}

async fn settle_failure(
    shared: &Shared,
    handler: &dyn DynHandler,
    record: &TaskRecord,
    err: TaskError,
) -> Result<bool, StoreError> {
    let now = shared.clock.now();
    let message = err.to_string();

    let alert_kind = if !err.is_retryable() {
        AlertKind::for_terminal(&err)
    } else {
        let retries = record.retries + 1;
        if retries <= shared.config.max_retries {
            let delay = shared.config.retry.next_delay(retries);
            warn!(
                task_id = %record.id,
                task_type = %record.task_type,
                retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "task failed, retrying"
            );
            return shared
                .store
                .retry_later(record.id, &shared.worker, &message, after(now, delay), now)
                .await;
        }
        AlertKind::RetriesExhausted
    };

    let owned = shared
        .store
        .fail(record.id, &shared.worker, &message, now)
        .await?;
    if owned {
        shared
            .alerts
            .raise(Alert {
                kind: alert_kind,
                task_id: record.id,
                task_type: record.task_type.clone(),
                subject: handler.subject(&record.params),
                message,
                raised_at: now,
            })
            .await;
    }
    Ok(owned)
}

async fn heartbeat_loop(shared: Arc<Shared>, task_id: TaskId) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    // the claim itself is the first beat
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match shared
            .store
            .heartbeat(task_id, &shared.worker, shared.clock.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(task_id = %task_id, "heartbeat rejected, claim lost");
                return;
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppBuilder;
    use crate::domain::{NewTask, TaskStatus};
    use crate::impls::{MemoryAlertSink, MemoryTaskStore};
    use crate::ports::FixedClock;
    use crate::typed::task::fixtures::{Echo, Sleep};
    use crate::typed::{Handler, Task};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with a transient error for the first `fail_first` calls.
    struct Flaky {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl Handler<Echo> for Flaky {
        async fn handle(&self, _task: Echo, _ctx: &TaskContext) -> Result<(), TaskError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(TaskError::Prove(crate::domain::ProveError::Resource(
                    "oom".into(),
                )));
            }
            Ok(())
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Handler<Sleep> for Sleeper {
        async fn handle(&self, task: Sleep, _ctx: &TaskContext) -> Result<(), TaskError> {
            tokio::time::sleep(Duration::from_millis(task.millis)).await;
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryTaskStore>,
        alerts: Arc<MemoryAlertSink>,
        clock: FixedClock,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryTaskStore::new()),
                alerts: Arc::new(MemoryAlertSink::new()),
                clock: FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            }
        }

        fn engine(&self, builder: AppBuilder, max_retries: u32) -> TaskEngine {
            builder
                .alerts(self.alerts.clone())
                .clock(Arc::new(self.clock.clone()))
                .config(EngineConfig {
                    max_retries,
                    ..EngineConfig::default()
                })
                .build(WorkerId::new("w1"), self.store.clone())
                .unwrap()
        }

        async fn enqueue(&self, task_type: &str, params: serde_json::Value) -> TaskId {
            self.store
                .create(NewTask::new(TaskType::new(task_type), params), self.clock.now())
                .await
                .unwrap()
                .id()
        }
    }

    #[tokio::test]
    async fn successful_task_is_marked_done() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let builder = AppBuilder::new()
            .register::<Echo, _>(Flaky { calls: calls.clone(), fail_first: 0 })
            .unwrap();
        let engine = h.engine(builder, 3);
        let id = h.enqueue(Echo::TYPE, json!({ "value": 1 })).await;

        assert_eq!(engine.poll_once().await.unwrap(), 1);
        engine.wait_idle().await;

        let record = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_then_succeeds() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let builder = AppBuilder::new()
            .register::<Echo, _>(Flaky { calls: calls.clone(), fail_first: 1 })
            .unwrap();
        let engine = h.engine(builder, 3);
        let id = h.enqueue(Echo::TYPE, json!({ "value": 1 })).await;

        engine.poll_once().await.unwrap();
        engine.wait_idle().await;
        let record = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retries, 1);

        // still backing off (base delay 2s)
        h.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(engine.poll_once().await.unwrap(), 0);

        h.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(engine.poll_once().await.unwrap(), 1);
        engine.wait_idle().await;
        let record = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_alert() {
        let h = Harness::new();
        let builder = AppBuilder::new()
            .register::<Echo, _>(Flaky { calls: Arc::new(AtomicUsize::new(0)), fail_first: usize::MAX })
            .unwrap();
        let engine = h.engine(builder, 2);
        let id = h.enqueue(Echo::TYPE, json!({ "value": 1 })).await;

        for _ in 0..3 {
            engine.poll_once().await.unwrap();
            engine.wait_idle().await;
            h.clock.advance(chrono::Duration::minutes(10));
        }

        let record = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retries, 2);

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::RetriesExhausted);
        assert_eq!(alerts[0].task_id, id);
    }

    #[tokio::test]
    async fn undecodable_params_fail_terminally() {
        let h = Harness::new();
        let builder = AppBuilder::new()
            .register::<Echo, _>(Flaky { calls: Arc::new(AtomicUsize::new(0)), fail_first: 0 })
            .unwrap();
        let engine = h.engine(builder, 5);
        let id = h.enqueue(Echo::TYPE, json!({ "nope": true })).await;

        engine.poll_once().await.unwrap();
        engine.wait_idle().await;

        let record = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retries, 0);
        assert_eq!(h.alerts.alerts()[0].kind, AlertKind::InvalidParams);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_caps_claims_per_type() {
        let h = Harness::new();
        let builder = AppBuilder::new()
            .register_with_limit::<Sleep, _>(Sleeper, 2)
            .unwrap();
        let engine = h.engine(builder, 5);
        for _ in 0..3 {
            h.enqueue(Sleep::TYPE, json!({ "millis": 1000 })).await;
        }

        assert_eq!(engine.poll_once().await.unwrap(), 2);
        assert_eq!(engine.poll_once().await.unwrap(), 0);
        assert_eq!(engine.counts().await.unwrap().running, 2);

        engine.wait_idle().await;
        assert_eq!(engine.poll_once().await.unwrap(), 1);
        engine.wait_idle().await;
        assert_eq!(engine.counts().await.unwrap().done, 3);
    }

    #[tokio::test]
    async fn two_engines_never_run_the_same_record() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let make = |name: &str| {
            AppBuilder::new()
                .register_with_limit::<Echo, _>(Flaky { calls: calls.clone(), fail_first: 0 }, 8)
                .unwrap()
                .clock(Arc::new(h.clock.clone()))
                .build(WorkerId::new(name), h.store.clone())
                .unwrap()
        };
        let a = make("a");
        let b = make("b");
        for v in 0..8 {
            h.enqueue(Echo::TYPE, json!({ "value": v })).await;
        }

        let (ra, rb) = tokio::join!(a.poll_once(), b.poll_once());
        assert_eq!(ra.unwrap() + rb.unwrap(), 8);
        a.wait_idle().await;
        b.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(h.store.counts().await.unwrap().done, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_is_dropped_when_the_claim_is_taken_over() {
        let h = Harness::new();
        let builder = AppBuilder::new()
            .register::<Sleep, _>(Sleeper)
            .unwrap();
        let engine = h.engine(builder, 5);
        let id = h.enqueue(Sleep::TYPE, json!({ "millis": 1_000_000 })).await;
        let started = tokio::time::Instant::now();
        assert_eq!(engine.poll_once().await.unwrap(), 1);

        // w1 looks dead to the store; w2 takes the record over
        h.clock.advance(chrono::Duration::minutes(5));
        let w2 = WorkerId::new("w2");
        let liveness = to_chrono(EngineConfig::default().liveness_timeout);
        assert!(h.store.try_claim(id, &w2, h.clock.now(), liveness).await.unwrap());

        // the next heartbeat is rejected and the execution ends well before the sleep
        engine.wait_idle().await;
        assert!(started.elapsed() < Duration::from_secs(60));

        let record = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert!(record.is_owned_by(&w2));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let h = Harness::new();
        let builder = AppBuilder::new()
            .register::<Sleep, _>(Sleeper)
            .unwrap();
        let engine = Arc::new(h.engine(builder, 5));
        h.enqueue(Sleep::TYPE, json!({ "millis": 10 })).await;

        let (tx, rx) = watch::channel(false);
        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run(rx).await })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.send(true).unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(h.store.counts().await.unwrap().done, 1);
    }
}
