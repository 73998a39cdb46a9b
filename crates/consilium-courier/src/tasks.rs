//! Background task bookkeeping for drains and registry listeners

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct BackgroundTasks {
    set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished tasks so the set does not grow without bound
        while let Some(result) = set.try_join_next() {
            log_join(result);
        }
        set.spawn(future);
    }

    /// Number of tasks not yet reaped
    pub fn len(&self) -> usize {
        self.set.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `grace` for running tasks, then abort the rest
    ///
    /// Returns how many tasks had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let mut set = std::mem::take(&mut *self.set.lock().unwrap_or_else(|e| e.into_inner()));
        if set.is_empty() {
            return 0;
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !set.is_empty() {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(result)) => log_join(result),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        let remaining = set.len();
        if remaining > 0 {
            debug!("Cancelling {} background task(s)", remaining);
            set.abort_all();
            while set.join_next().await.is_some() {}
        }
        remaining
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!("Background task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_waits_for_quick_tasks() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(true, Ordering::SeqCst);
        });

        assert_eq!(tasks.shutdown(Duration::from_secs(1)).await, 0);
        assert!(done.load(Ordering::SeqCst));
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_tasks() {
        let tasks = BackgroundTasks::new();
        tasks.spawn(std::future::pending());
        assert_eq!(tasks.shutdown(Duration::from_millis(20)).await, 1);
    }
}
