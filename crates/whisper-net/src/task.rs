//! Supervised background tasks.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Identifier of a task spawned on a [`TaskManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

type Registry = Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>;

/// Registry of spawned tasks.
///
/// Finished tasks remove themselves. A task that returns an error or panics
/// is logged and otherwise ignored; cancelled tasks are not logged. Dropping
/// the manager aborts whatever is still running.
#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Registry,
    next_id: AtomicU64,
}

impl TaskManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `future` on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<F, E>(&self, name: impl Into<String>, future: F) -> TaskId
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        let registry = Arc::clone(&self.tasks);

        // Held across spawn so the task can't deregister before it is registered.
        let mut tasks = self.tasks.lock();
        let handle = tokio::spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => debug!(task = %name, %id, "task finished"),
                Ok(Err(e)) => error!(task = %name, %id, error = %e, "task failed"),
                Err(panic) => {
                    error!(task = %name, %id, panic = panic_message(&*panic), "task panicked");
                }
            }
            registry.lock().remove(&id);
        });
        tasks.insert(id, handle);
        id
    }

    /// Aborts a task. Returns false if it had already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        let Some(handle) = self.tasks.lock().remove(&id) else {
            return false;
        };
        handle.abort();
        true
    }

    /// Aborts every task without waiting for them to stop.
    pub fn abort_all(&self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }

    /// Aborts every task and waits for each to stop.
    pub async fn close(&self) {
        let handles: Vec<_> = self.tasks.lock().drain().collect();
        for (_, handle) in &handles {
            handle.abort();
        }
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(%id, error = %e, "task ended abnormally during close");
                }
            }
        }
    }

    /// Number of tasks still running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if no task is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
