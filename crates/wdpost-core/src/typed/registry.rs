//! TypedRegistry - Handler の登録と管理
//!
//! - `register::<T, H>(handler)` で登録、内部で TypedHandler に包んで型消去
//! - task_type ごとに同時実行数の上限を持つ（証明計算は CPU / メモリを食う）

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;

/// One registered task type.
#[derive(Clone)]
pub struct Registered {
    pub handler: Arc<dyn DynHandler>,
    pub max_concurrent: usize,
}

#[derive(Default)]
pub struct TypedRegistry {
    handlers: HashMap<String, Registered>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Task type '{0}' needs a concurrency limit of at least 1")]
    ZeroConcurrency(String),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers with a concurrency limit of one.
    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_with_limit::<T, H>(handler, 1)
    }

    pub fn register_with_limit<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
        max_concurrent: usize,
    ) -> Result<(), RegistryError> {
        let task_type = T::TYPE.to_string();
        if max_concurrent == 0 {
            return Err(RegistryError::ZeroConcurrency(task_type));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        let typed_handler = TypedHandler::<T, H>::new(handler);
        self.handlers.insert(
            task_type,
            Registered {
                handler: Arc::new(typed_handler),
                max_concurrent,
            },
        );
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&Registered> {
        self.handlers.get(task_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Registered)> {
        self.handlers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
