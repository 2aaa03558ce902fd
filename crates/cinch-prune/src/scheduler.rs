//! Deferred background work.
//!
//! Tasks are fire-and-forget: a failure is logged and dropped, never
//! propagated to the hook that scheduled it. Each task can be cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// A spawned background task.
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `task` after `delay` on the current runtime.
    pub fn spawn<F>(name: impl Into<String>, delay: Duration, task: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let label = name.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match task.await {
                Ok(()) => debug!("Background task {label} finished"),
                Err(e) => warn!("Background task {label} failed: {e}"),
            }
        });
        Self { name, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task. Returns `false` if it was cancelled.
    pub async fn join(self) -> bool {
        self.handle.await.is_ok()
    }
}

/// Keyed tasks, at most one unfinished task per key.
///
/// Still-running tasks are aborted on drop.
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` unless `key` already has an unfinished task, in which
    /// case `task` is dropped. Returns whether it was scheduled.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, task: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let key = key.into();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.get(&key).is_some_and(|t| !t.is_finished()) {
            debug!("Task {key} still pending, dropping trigger");
            return false;
        }
        let scheduled = ScheduledTask::spawn(key.clone(), delay, task);
        tasks.insert(key, scheduled);
        true
    }

    /// Cancel the task for `key`. Returns whether one was still running.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        match removed {
            Some(task) if !task.is_finished() => {
                debug!("Cancelling task {}", task.name());
                task.cancel();
                true
            }
            _ => false,
        }
    }

    /// Take the task for `key` out of the scheduler, e.g. to await it.
    pub fn take(&self, key: &str) -> Option<ScheduledTask> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, task) in tasks.drain() {
            task.cancel();
        }
    }
}
