//! AlertSink implementations.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::error;

use crate::domain::Alert;
use crate::ports::AlertSink;

/// Emits each alert as an `error!` event on target `wdpost::alert`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: Alert) {
        let provider = alert.subject.as_ref().map(|s| s.provider.to_string());
        let deadline = alert.subject.as_ref().map(|s| s.deadline);
        error!(
            target: "wdpost::alert",
            kind = %alert.kind,
            task_id = %alert.task_id,
            task_type = %alert.task_type,
            provider = ?provider,
            deadline = ?deadline,
            "{}",
            alert.message
        );
    }
}

/// Keeps alerts in memory (tests, status views).
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn raise(&self, alert: Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}
