//! Task management for async service lifecycle.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default time a task gets to finish after cancellation.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Manages named background tasks that share one cancellation root.
///
/// Each task receives a child token of the manager's root token, so a task
/// can be cancelled alone or together with everything else by
/// [`TaskManager::shutdown_all`].
pub struct TaskManager {
    tasks: HashMap<String, TaskInfo>,
    root_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_shutdown_timeout(SHUTDOWN_TIMEOUT)
    }

    pub fn with_shutdown_timeout(shutdown_timeout: Duration) -> Self {
        Self {
            tasks: HashMap::new(),
            root_token: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Spawns and registers a task with the given name.
    ///
    /// A task already registered under `name` is cancelled first.
    pub fn spawn_task<F, Fut>(&mut self, name: impl Into<String>, task_fn: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if let Some(previous) = self.tasks.remove(&name) {
            warn!("Task '{name}' replaced while still registered");
            previous.cancel_token.cancel();
        }

        let task_token = self.root_token.child_token();
        let task_token_clone = task_token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting task: {task_name}");
            match task_fn(task_token_clone).await {
                Ok(()) => {
                    info!("Task '{task_name}' completed");
                    Ok(())
                }
                Err(e) => {
                    error!("Task '{task_name}' failed: {e:#}");
                    Err(e)
                }
            }
        });

        self.tasks.insert(
            name,
            TaskInfo {
                handle,
                cancel_token: task_token,
            },
        );
    }

    /// Cancels one task without waiting for it.
    #[cfg(test)]
    pub fn cancel(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .map(|task| task.cancel_token.cancel())
            .is_some()
    }

    /// Cancels every task and waits up to the shutdown timeout for each.
    ///
    /// Returns the first error encountered, if any.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());

        self.root_token.cancel();

        let mut first_error = None;
        let tasks: Vec<_> = self.tasks.drain().collect();

        for (name, task) in tasks {
            let outcome = match tokio::time::timeout(self.shutdown_timeout, task.handle).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e.context(format!("Task '{name}' failed"))),
                Ok(Err(e)) => Some(anyhow::anyhow!("Task '{name}' panicked: {e}")),
                Err(_) => Some(anyhow::anyhow!(
                    "Task '{name}' did not stop within {:?}",
                    self.shutdown_timeout
                )),
            };
            if let Some(e) = outcome {
                error!("{e:#}");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(error) => Err(error).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|task| !task.handle.is_finished())
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

struct TaskInfo {
    handle: JoinHandle<Result<()>>,
    cancel_token: CancellationToken,
}
