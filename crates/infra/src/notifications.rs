//! Finalization notifications.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use backtestq_core::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Completed,
    Failed,
}

/// Emitted once per job, after its finalizing write succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobNotification {
    pub job_id: JobId,
    pub kind: NotificationKind,
    pub message: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: JobNotification);
}

/// Default sink: one structured log line per notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: JobNotification) {
        info!(
            job_id = %notification.job_id,
            kind = ?notification.kind,
            message = %notification.message,
            "job finalized"
        );
    }
}

/// Collects notifications; for tests.
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    sent: Mutex<Vec<JobNotification>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<JobNotification> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(&self, notification: JobNotification) {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(notification);
    }
}
