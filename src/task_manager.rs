//! Manages the lifecycle of all spawned tasks in the application.
use crate::error::PipelineError;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type TaskResult = Result<(), PipelineError>;

/// Resolves once shutdown has been requested.
///
/// A dropped sender is not a shutdown request: the future then never
/// resolves, and the caller keeps working until it finishes on its own.
pub async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let closed = shutdown_rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// A centralized manager for all spawned tasks.
///
/// This struct is responsible for:
/// - Spawning tasks and keeping track of their `JoinHandle`s.
/// - Signalling every task to stop as soon as one of them fails.
/// - Awaiting all tasks and reporting the first failure.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Vec<(String, JoinHandle<TaskResult>)>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    /// Creates a new `TaskManager` with its own shutdown channel.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Spawns a new task and adds its handle to the manager.
    ///
    /// If the task returns an error, shutdown is triggered for all others.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = TaskResult> + Send + 'static,
    {
        let name = name.into();
        debug!(task_name = %name, "Spawning task");
        let shutdown_tx = self.shutdown_tx.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let result = future.await;
            if let Err(e) = &result {
                error!(task_name = %task_name, error = %e, "Task failed, stopping all tasks.");
                shutdown_tx.send_replace(true);
            }
            result
        });
        self.lock_handles().push((name, handle));
    }

    /// Signals every task to stop.
    pub fn trigger_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Returns a clone of the shutdown receiver.
    pub fn get_shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<(String, JoinHandle<TaskResult>)>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits for all managed tasks to complete.
    ///
    /// Returns the first error reported by a task, in spawn order. A panicked
    /// task is reported as a handler fault.
    pub async fn shutdown(self) -> TaskResult {
        let handles = self.lock_handles().drain(..).collect::<Vec<_>>();
        info!(
            "TaskManager shutting down. Waiting for {} tasks to complete...",
            handles.len()
        );

        let task_names: Vec<String> = handles.iter().map(|(name, _)| name.clone()).collect();
        debug!(tasks = ?task_names, "Awaiting all tasks.");

        let results = join_all(handles.into_iter().map(|(_, handle)| handle)).await;

        let mut first_error = None;
        for (task_name, result) in task_names.into_iter().zip(results) {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(task_name = %task_name, "Task panicked during shutdown.");
                    Err(PipelineError::HandlerFault {
                        queue: task_name.clone(),
                        reason: format!("task panicked: {}", e),
                    })
                }
            };
            match outcome {
                Ok(()) => debug!(task_name = %task_name, "Task shut down gracefully."),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => {
                info!("All tasks shut down gracefully.");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }
}
