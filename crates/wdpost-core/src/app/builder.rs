//! AppBuilder - TaskEngine の構築とワイヤリング
//!
//! - 起動時検証（Fail-fast）: 期待する task_type が全部登録されているか
//! - 省略したポートはデフォルト（SystemClock, TracingAlertSink）

use std::sync::Arc;

use super::engine::{EngineConfig, TaskEngine};
use crate::domain::WorkerId;
use crate::impls::TracingAlertSink;
use crate::ports::{AlertSink, Clock, SystemClock, TaskStore};
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

/// # 使用例
/// ```ignore
/// let engine = AppBuilder::new()
///     .register_with_limit::<WdPost, _>(compute_handler, cfg.subsystems.window_post_max_tasks)?
///     .register::<WdPostSubmit, _>(submit_handler)?
///     .expect_tasks(&[WdPost::TYPE, WdPostSubmit::TYPE])
///     .config(cfg.engine_config())
///     .build(WorkerId::generate("provider"), store)?;
/// ```
pub struct AppBuilder {
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("No task handlers registered")]
    NoHandlers,

    #[error("liveness timeout {liveness:?} must exceed heartbeat interval {heartbeat:?}")]
    Liveness {
        liveness: std::time::Duration,
        heartbeat: std::time::Duration,
    },
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TypedRegistry::new(),
            expected_tasks: None,
            alerts: Arc::new(TracingAlertSink),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_with_limit<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
        max_concurrent: usize,
    ) -> Result<Self, RegistryError> {
        self.registry
            .register_with_limit::<T, H>(handler, max_concurrent)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// # 検証
    /// - 少なくとも 1 つの handler が登録されている
    /// - expect_tasks() の task_type が全て登録されている
    /// - liveness timeout > heartbeat interval（でないと生きている owner から奪われる）
    pub fn build(
        self,
        worker: WorkerId,
        store: Arc<dyn TaskStore>,
    ) -> Result<TaskEngine, BuildError> {
        if self.registry.is_empty() {
            return Err(BuildError::NoHandlers);
        }
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        if self.config.liveness_timeout <= self.config.heartbeat_interval {
            return Err(BuildError::Liveness {
                liveness: self.config.liveness_timeout,
                heartbeat: self.config.heartbeat_interval,
            });
        }

        Ok(TaskEngine::new(
            worker,
            store,
            self.registry,
            self.alerts,
            self.clock,
            self.config,
        ))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskError;
    use crate::impls::MemoryTaskStore;
    use crate::typed::TaskContext;
    use crate::typed::task::fixtures::{Echo, Sleep};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl Handler<Echo> for Noop {
        async fn handle(&self, _task: Echo, _ctx: &TaskContext) -> Result<(), TaskError> {
            Ok(())
        }
    }

    fn store() -> Arc<dyn TaskStore> {
        Arc::new(MemoryTaskStore::new())
    }

    #[test]
    fn build_success() {
        let engine = AppBuilder::new()
            .register::<Echo, _>(Noop)
            .unwrap()
            .expect_tasks(&[Echo::TYPE])
            .build(WorkerId::new("w"), store())
            .unwrap();
        assert_eq!(engine.task_types(), vec![Echo::TYPE]);
    }

    #[test]
    fn build_missing_task_types() {
        let result = AppBuilder::new()
            .register::<Echo, _>(Noop)
            .unwrap()
            .expect_tasks(&[Echo::TYPE, Sleep::TYPE])
            .build(WorkerId::new("w"), store());
        assert!(matches!(
            result,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![Sleep::TYPE.to_string()]
        ));
    }

    #[test]
    fn build_without_handlers() {
        let result = AppBuilder::new().build(WorkerId::new("w"), store());
        assert!(matches!(result, Err(BuildError::NoHandlers)));
    }

    #[test]
    fn build_rejects_liveness_below_heartbeat() {
        let result = AppBuilder::new()
            .register::<Echo, _>(Noop)
            .unwrap()
            .config(EngineConfig {
                liveness_timeout: Duration::from_secs(10),
                heartbeat_interval: Duration::from_secs(10),
                ..EngineConfig::default()
            })
            .build(WorkerId::new("w"), store());
        assert!(matches!(result, Err(BuildError::Liveness { .. })));
    }
}
