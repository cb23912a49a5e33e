use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scope::TaskScope;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// A delayed task that can be cancelled before it fires. Dropping the
/// handle cancels it too; once the action has started it runs to completion.
pub struct TimerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `action` after `delay`, unless cancelled first.
pub fn schedule<A, AF>(scope: &TaskScope, delay: Duration, action: A) -> TimerHandle
where
    A: FnOnce() -> AF + Send + 'static,
    AF: Future<Output = ()> + Send + 'static,
{
    schedule_gated(scope, delay, || async { true }, action)
}

/// Run `action` after `delay` if `guard` still holds at that moment.
pub fn schedule_gated<G, GF, A, AF>(
    scope: &TaskScope,
    delay: Duration,
    guard: G,
    action: A,
) -> TimerHandle
where
    G: FnOnce() -> GF + Send + 'static,
    GF: Future<Output = bool> + Send + 'static,
    A: FnOnce() -> AF + Send + 'static,
    AF: Future<Output = ()> + Send + 'static,
{
    let token = scope.token().child_token();
    let cancelled = token.clone();
    let task = scope.spawn(async move {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if guard().await {
            action().await;
        }
    });
    TimerHandle { token, task }
}

/// Holds at most one armed timer; arming a new one cancels the old one.
#[derive(Default)]
pub struct TimerSlot {
    current: Mutex<Option<TimerHandle>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, handle: TimerHandle) {
        let previous = self.current.lock().replace(handle);
        drop(previous);
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.current.lock().take() {
            handle.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}
