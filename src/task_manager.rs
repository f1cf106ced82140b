//! Task management for the daemon's long-running services.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

type TaskOutput = (String, Result<()>);

/// Owns spawned service tasks and the token that cancels them.
///
/// Each task receives a child of the global token and is expected to return
/// promptly once it is cancelled.
pub struct TaskManager {
    tasks: JoinSet<TaskOutput>,
    global_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl TaskManager {
    /// Creates a new TaskManager.
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            global_token: CancellationToken::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Spawns `task_fn` under `name` with its own cancellation token.
    pub fn spawn_task<F, Fut>(&mut self, name: impl Into<String>, task_fn: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let task_token = self.global_token.child_token();
        let task_name = name.clone();

        self.tasks.spawn(async move {
            info!("Starting task: {task_name}");
            let result = task_fn(task_token).await;
            match &result {
                Ok(()) => info!("Task '{task_name}' completed"),
                Err(e) => error!("Task '{task_name}' failed: {e:#}"),
            }
            (task_name, result)
        });

        info!("Task '{name}' spawned");
    }

    /// Waits for the next task to finish on its own.
    ///
    /// Returns `None` when no task is running.
    pub async fn next_exit(&mut self) -> Option<TaskOutput> {
        self.tasks.join_next().await.map(flatten)
    }

    /// Returns the count of running tasks.
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Cancels every task and waits for all of them to finish.
    ///
    /// Tasks still running after the shutdown timeout are aborted. Returns
    /// the first error encountered, if any.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());
        self.global_token.cancel();

        let mut first_error = None;
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => {
                    if let (name, Err(e)) = flatten(joined) {
                        warn!("Task '{name}' failed during shutdown: {e:#}");
                        first_error.get_or_insert(e);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    error!("Task shutdown timeout exceeded, aborting remaining tasks");
                    self.tasks.abort_all();
                    first_error.get_or_insert(anyhow!("Task shutdown timeout exceeded"));
                    break;
                }
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
}

fn flatten(joined: Result<TaskOutput, JoinError>) -> TaskOutput {
    joined.unwrap_or_else(|e| ("unknown".to_string(), Err(anyhow!("Task panicked: {e}"))))
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
