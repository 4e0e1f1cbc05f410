//! Task Record: one unit of claimable work shared by the fleet.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{TaskId, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Task status.
///
/// State transitions:
/// - Pending -> Running -> Done
/// - Pending -> Running -> Pending (retryable failure, under the retry limit)
/// - Pending -> Running -> Failed (terminal failure or retries exhausted)
/// - Running -> Running (re-claimed after the owner's claim expired)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub params: serde_json::Value,
    pub dedupe_key: Option<String>,

    pub status: TaskStatus,
    pub owner: Option<WorkerId>,

    /// Set on claim, refreshed by heartbeats.
    pub claimed_at: Option<DateTime<Utc>>,

    /// Handler failures so far (crash re-claims do not count).
    pub retries: u32,
    pub last_error: Option<String>,

    /// Backoff: not claimable before this instant.
    pub not_before: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, task: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: task.task_type,
            params: task.params,
            dedupe_key: task.dedupe_key,
            status: TaskStatus::Pending,
            owner: None,
            claimed_at: None,
            retries: 0,
            last_error: None,
            not_before: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The claim predicate every store implements atomically:
    /// pending and past its backoff, or running with a claim older than
    /// `liveness` (owner presumed crashed).
    pub fn is_claimable(&self, now: DateTime<Utc>, liveness: Duration) -> bool {
        match self.status {
            TaskStatus::Pending => self.not_before.is_none_or(|t| t <= now),
            TaskStatus::Running => self.claimed_at.is_none_or(|t| t + liveness < now),
            TaskStatus::Done | TaskStatus::Failed => false,
        }
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.status == TaskStatus::Running && self.owner.as_ref() == Some(worker)
    }

    pub fn claim(&mut self, owner: &WorkerId, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.owner = Some(owner.clone());
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Done;
        self.owner = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.owner = None;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    pub fn schedule_retry(&mut self, error: String, not_before: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.owner = None;
        self.claimed_at = None;
        self.retries += 1;
        self.last_error = Some(error);
        self.not_before = Some(not_before);
        self.updated_at = now;
    }
}

/// Input to `TaskStore::create`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub params: serde_json::Value,
    pub dedupe_key: Option<String>,
}

impl NewTask {
    pub fn new(task_type: TaskType, params: serde_json::Value) -> Self {
        Self {
            task_type,
            params,
            dedupe_key: None,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Result of `TaskStore::create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Created(TaskId),
    /// A task with the same dedupe key already existed.
    Existing(TaskId),
}

impl Enqueued {
    pub fn id(self) -> TaskId {
        match self {
            Enqueued::Created(id) | Enqueued::Existing(id) => id,
        }
    }
}
