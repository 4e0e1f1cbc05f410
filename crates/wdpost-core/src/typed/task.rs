//! Task trait - 型付き Task の定義
//!
//! # Trait Bounds
//! - `Serialize` / `DeserializeOwned`: Task Record の params との相互変換
//! - `Send + Sync + 'static`: Arc に格納して複数タスクから使うため

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{AlertSubject, NewTask, TaskError, TaskType};

/// Task は task_type と params の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct WdPost { provider: Address, deadline: DeadlineInfo, partitions: Vec<u64> }
///
/// impl Task for WdPost {
///     const TYPE: &'static str = "wdpost.compute.v1";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// `{domain}.{action}.v{major}`
    const TYPE: &'static str;

    /// Provider/deadline named in alerts about this task.
    fn subject(&self) -> Option<AlertSubject> {
        None
    }
}

/// Task Record input for a typed task.
pub fn new_task<T: Task>(task: &T) -> Result<NewTask, TaskError> {
    let params = serde_json::to_value(task)
        .map_err(|e| TaskError::Params(format!("{}: {e}", T::TYPE)))?;
    Ok(NewTask::new(TaskType::new(T::TYPE), params))
}
