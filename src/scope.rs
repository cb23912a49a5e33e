use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Owner of every background task a node starts.
///
/// Tasks are tracked so that [`TaskScope::shutdown`] can cancel them and wait
/// for whatever is still in flight to finish.
#[derive(Clone, Default)]
pub struct TaskScope {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl TaskScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancel all tasks and wait for them to drain.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_work() {
        let scope = TaskScope::new();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let token = scope.token().clone();
        scope.spawn(async move {
            token.cancelled().await;
            // Work that outlives the cancellation signal is still drained
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        scope.shutdown().await;
        assert!(scope.is_shutdown());
        assert!(finished.load(Ordering::SeqCst));
    }
}
