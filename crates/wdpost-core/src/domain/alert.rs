//! Operator-visible alerts for terminal task failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::chain::Address;
use super::errors::TaskError;
use super::ids::TaskId;
use super::task::TaskType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    UnprovableDeadline,
    DeadlineExpired,
    Unaffordable,
    RetriesExhausted,
    InvalidParams,
}

impl AlertKind {
    /// Alert for a terminal handler error. Retryable errors only alert
    /// once retries run out.
    pub fn for_terminal(err: &TaskError) -> Self {
        match err {
            TaskError::NoProvableSectors { .. } => AlertKind::UnprovableDeadline,
            TaskError::DeadlineExpired { .. } | TaskError::DeclarationCutoff { .. } => {
                AlertKind::DeadlineExpired
            }
            TaskError::Unaffordable { .. } | TaskError::InsufficientFunds { .. } => {
                AlertKind::Unaffordable
            }
            TaskError::Params(_) => AlertKind::InvalidParams,
            _ => AlertKind::RetriesExhausted,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::UnprovableDeadline => "unprovable deadline",
            AlertKind::DeadlineExpired => "deadline expired",
            AlertKind::Unaffordable => "unaffordable",
            AlertKind::RetriesExhausted => "retries exhausted",
            AlertKind::InvalidParams => "invalid params",
        };
        f.write_str(s)
    }
}

/// Provider and deadline a task works on, when its params name them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSubject {
    pub provider: Address,
    pub deadline: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub subject: Option<AlertSubject>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}
