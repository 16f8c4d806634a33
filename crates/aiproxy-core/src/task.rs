//! Task Service (spec §4.3): a single-slot executor tracking
//! `{running, progress, total, result, error}`, used to drive long
//! import/delete/copy operations with progress reporting and cooperative
//! cancellation.
//!
//! Exactly one task may run at a time; `start_task` fails with
//! [`crate::error::Error::TaskServiceUnavailable`] if another is already
//! running. `UpdateProgress` is called from the task's own async task and
//! must stay safe against concurrent `GetTaskStatus` reads (spec §5) —
//! guaranteed here by guarding the whole slot behind one `tokio::sync::Mutex`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The kind of long-running operation occupying the task slot (spec
/// §4.1.3 Large tier, §4.1.4 Async tier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    GroupDelete,
    GroupCopy,
    KeyImport,
}

/// Current state of the single task slot, returned by `GetTaskStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub is_running: bool,
    pub task_type: Option<TaskType>,
    pub subject: Option<String>,
    pub progress: u64,
    pub total: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self {
            is_running: false,
            task_type: None,
            subject: None,
            progress: 0,
            total: 0,
            result: None,
            error: None,
        }
    }
}

struct Slot {
    status: TaskStatus,
    cancel: Option<CancellationToken>,
}

/// Single-slot async task executor (spec §4.3).
pub struct TaskService {
    slot: tokio::sync::Mutex<Slot>,
}

/// A handle returned to the caller that started a task, used to report
/// progress and completion from within the task's own execution.
pub struct TaskHandle {
    service: Arc<TaskService>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Updates `progress` (out of the `total` given to `start_task`).
    pub async fn update_progress(&self, progress: u64) {
        let mut slot = self.service.slot.lock().await;
        slot.status.progress = progress;
    }

    /// Marks the task finished, with either a result or an error (never
    /// both). Frees the slot for the next `start_task` call.
    pub async fn end_task(&self, result: Option<serde_json::Value>, error: Option<String>) {
        let mut slot = self.service.slot.lock().await;
        slot.status.is_running = false;
        slot.status.result = result;
        slot.status.error = error;
        slot.cancel = None;
    }

    /// The cooperative-cancellation token carried through the operation
    /// (spec §5's "context-like object").
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for TaskService {
    fn default() -> Self {
        Self {
            slot: tokio::sync::Mutex::new(Slot {
                status: TaskStatus::default(),
                cancel: None,
            }),
        }
    }
}

impl TaskService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts a task, failing if one is already running (spec §4.3:
    /// "Exactly one task may run at a time").
    pub async fn start_task(
        self: &Arc<Self>,
        task_type: TaskType,
        subject: impl Into<String>,
        total: u64,
    ) -> Result<TaskHandle> {
        let mut slot = self.slot.lock().await;
        if slot.status.is_running {
            return Err(Error::TaskServiceUnavailable);
        }
        let cancel = CancellationToken::new();
        slot.status = TaskStatus {
            is_running: true,
            task_type: Some(task_type),
            subject: Some(subject.into()),
            progress: 0,
            total,
            result: None,
            error: None,
        };
        slot.cancel = Some(cancel.clone());
        Ok(TaskHandle {
            service: Arc::clone(self),
            cancel,
        })
    }

    /// Current task status snapshot (spec §4.3 `GetTaskStatus`).
    pub async fn status(&self) -> TaskStatus {
        self.slot.lock().await.status.clone()
    }

    /// Requests cancellation of the in-flight task, if any. The task body
    /// observes this via [`TaskHandle::cancellation_token`]; spec §5 notes
    /// background deletions use a fresh detached context and may ignore
    /// caller cancellation for the cleanup phase specifically.
    pub async fn cancel(&self) {
        if let Some(token) = &self.slot.lock().await.cancel {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_concurrent_start() {
        let service = TaskService::new();
        let _h1 = service
            .start_task(TaskType::GroupDelete, "group:1", 100)
            .await
            .unwrap();
        let err = service
            .start_task(TaskType::GroupCopy, "group:2", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskServiceUnavailable));
    }

    #[tokio::test]
    async fn progress_and_end_are_visible_to_status() {
        let service = TaskService::new();
        let handle = service
            .start_task(TaskType::GroupDelete, "group:1", 100)
            .await
            .unwrap();

        handle.update_progress(42).await;
        let status = service.status().await;
        assert_eq!(status.progress, 42);
        assert_eq!(status.total, 100);
        assert!(status.is_running);

        handle
            .end_task(Some(serde_json::json!({"deleted_count": 100})), None)
            .await;
        let status = service.status().await;
        assert!(!status.is_running);
        assert_eq!(status.result.unwrap()["deleted_count"], 100);
    }

    #[tokio::test]
    async fn slot_frees_after_end_allowing_new_task() {
        let service = TaskService::new();
        let handle = service
            .start_task(TaskType::GroupDelete, "group:1", 1)
            .await
            .unwrap();
        handle.end_task(None, Some("boom".into())).await;

        let status = service.status().await;
        assert_eq!(status.error.as_deref(), Some("boom"));

        assert!(service
            .start_task(TaskType::GroupCopy, "group:2", 1)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn cancellation_token_observed_by_task_body() {
        let service = TaskService::new();
        let handle = service
            .start_task(TaskType::GroupDelete, "group:1", 1)
            .await
            .unwrap();
        let token = handle.cancellation_token().clone();
        assert!(!token.is_cancelled());
        service.cancel().await;
        assert!(token.is_cancelled());
    }
}
