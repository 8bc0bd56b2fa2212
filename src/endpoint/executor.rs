//! Executor for long-running or blocking endpoint work.
//!
//! Work runs on tokio's blocking pool so it never occupies an I/O worker.
//! When `threads.long_running_task_threads` is non-zero the number of
//! concurrently running tasks is capped by a semaphore.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::ThreadConfig;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("long-running task panicked")]
    Panicked,

    #[error("long-running task was cancelled")]
    Cancelled,

    #[error("long-running executor is closed")]
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct LongRunningExecutor {
    permits: Option<Arc<Semaphore>>,
}

impl LongRunningExecutor {
    pub fn unbounded() -> Self {
        Self { permits: None }
    }

    pub fn bounded(max_concurrent: usize) -> Self {
        Self {
            permits: Some(Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    pub fn from_config(config: &ThreadConfig) -> Self {
        match config.long_running_task_threads {
            0 => Self::unbounded(),
            n => Self::bounded(n),
        }
    }

    /// Permits currently free, `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(|s| s.available_permits())
    }

    /// Run `task` off the I/O threads and await its result.
    pub async fn run<F, T>(&self, task: F) -> Result<T, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = match &self.permits {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| ExecutorError::Closed)?,
            ),
            None => None,
        };

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                ExecutorError::Panicked
            } else {
                ExecutorError::Cancelled
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_blocking_work() {
        let executor = LongRunningExecutor::unbounded();
        let value = executor.run(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn reports_panics() {
        let executor = LongRunningExecutor::unbounded();
        let result = executor.run(|| -> u8 { panic!("boom") }).await;
        assert!(matches!(result, Err(ExecutorError::Panicked)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounded_executor_limits_concurrency() {
        let executor = LongRunningExecutor::bounded(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let executor = executor.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                executor
                    .run(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(executor.available(), Some(1));
    }
}
