//! Handler trait - Task を実行する Handler の定義
//!
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use async_trait::async_trait;
use std::marker::PhantomData;

use super::task::Task;
use crate::domain::{AlertSubject, TaskError, TaskId, WorkerId};

/// Claim に紐づく実行コンテキスト
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub worker: WorkerId,
    /// Failed attempts before this one.
    pub retries: u32,
}

/// Handler は Task を実行する
///
/// 同じ Task Record はクラッシュ後に別 worker で再実行されうるので、
/// handler は冪等であること（副作用の重複は outbox の dedupe で防ぐ）。
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// HashMap<String, Arc<dyn DynHandler>> に格納するための型消去層。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        params: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<(), TaskError>;

    /// Best effort: `None` when the params do not decode.
    fn subject(&self, params: &serde_json::Value) -> Option<AlertSubject>;

    fn task_type(&self) -> &'static str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        params: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<(), TaskError> {
        // 壊れた params はリトライしても直らない -> Params (terminal)
        let task: T = serde_json::from_value(params)
            .map_err(|e| TaskError::Params(format!("{}: {e}", T::TYPE)))?;
        self.handler.handle(task, ctx).await
    }

    fn subject(&self, params: &serde_json::Value) -> Option<AlertSubject> {
        serde_json::from_value::<T>(params.clone())
            .ok()
            .and_then(|t| t.subject())
    }

    fn task_type(&self) -> &'static str {
        T::TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use crate::typed::task::fixtures::Echo;
    use serde_json::json;
    use ulid::Ulid;

    struct EchoHandler;

    #[async_trait]
    impl Handler<Echo> for EchoHandler {
        async fn handle(&self, task: Echo, _ctx: &TaskContext) -> Result<(), TaskError> {
            if task.value < 0 {
                return Err(TaskError::Params("negative".into()));
            }
            Ok(())
        }
    }

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: TaskId::from_ulid(Ulid::new()),
            worker: WorkerId::new("w"),
            retries: 0,
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_params() {
        let typed = TypedHandler::<Echo, _>::new(EchoHandler);
        typed.handle_dyn(json!({ "value": 100 }), &ctx()).await.unwrap();
        assert_eq!(typed.task_type(), "test.echo.v1");
    }

    #[tokio::test]
    async fn undecodable_params_are_terminal() {
        let typed = TypedHandler::<Echo, _>::new(EchoHandler);
        let err = typed
            .handle_dyn(json!({ "wrong": true }), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Terminal);
    }
}
