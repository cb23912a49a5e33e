//! Matching of outbound requests to responses that arrive later, in any
//! order, on a shared connection.
//!
//! Every request gets a [`CorrelationId`] before it is written to the wire.
//! The id stays in the pending table until its response is consumed, its
//! waiter gives up, or the deadline stamped at allocation passes with nobody
//! waiting. Slot registration, response delivery and reclamation all
//! happen under one mutex, so a response that lands before anyone waits for
//! it is parked in the table instead of being lost.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};

use crate::error::{RaftError, Result};
use crate::rpc::message::CorrelationId;

enum Slot<T> {
    /// Sent, nobody waiting yet, no response yet.
    InFlight { deadline: Instant },
    /// A waiter is registered; it owns the timeout from here on.
    Waiting(oneshot::Sender<T>),
    /// Response arrived before anyone waited for it.
    Ready { response: T, deadline: Instant },
}

impl<T> Slot<T> {
    fn is_expired(&self, now: Instant) -> bool {
        match self {
            Slot::InFlight { deadline } | Slot::Ready { deadline, .. } => *deadline <= now,
            Slot::Waiting(_) => false,
        }
    }
}

/// Drop unclaimed slots whose deadline has passed.
fn sweep_expired<T>(pending: &mut HashMap<CorrelationId, Slot<T>>) {
    let now = Instant::now();
    let before = pending.len();
    pending.retain(|_, slot| !slot.is_expired(now));
    let swept = before - pending.len();
    if swept > 0 {
        tracing::trace!(swept, "Reclaimed expired requests nobody waited for");
    }
}

struct Inner<T> {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, Slot<T>>>,
}

/// Pending-request table for one connection.
pub struct CorrelationEngine<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CorrelationEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for CorrelationEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CorrelationEngine<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Reserve a fresh id and mark it in flight. Call this before the request
    /// is transmitted.
    ///
    /// If no waiter registers before `timeout` elapses, the id (and any
    /// response parked under it) is reclaimed by the next sweep.
    pub fn allocate(&self, timeout: Duration) -> CorrelationId {
        let id = CorrelationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut pending = self.inner.pending.lock();
        sweep_expired(&mut pending);
        pending.insert(
            id,
            Slot::InFlight {
                deadline: Instant::now() + timeout,
            },
        );
        id
    }

    /// Deliver a response. Returns false when nothing could take it: the id
    /// is unknown, was already reclaimed by a timeout, or already answered.
    pub fn complete(&self, id: CorrelationId, response: T) -> bool {
        let mut pending = self.inner.pending.lock();
        sweep_expired(&mut pending);
        match pending.remove(&id) {
            Some(Slot::InFlight { deadline }) => {
                pending.insert(id, Slot::Ready { response, deadline });
                true
            }
            Some(Slot::Waiting(tx)) => tx.send(response).is_ok(),
            Some(ready @ Slot::Ready { .. }) => {
                pending.insert(id, ready);
                tracing::debug!(%id, "Duplicate response dropped");
                false
            }
            None => {
                tracing::debug!(%id, "Response for unknown or reclaimed request dropped");
                false
            }
        }
    }

    /// Register a waiter for `id` and return a handle that resolves to the
    /// response, or to [`RaftError::RequestTimeout`] once `timeout` elapses.
    /// The handle does nothing until polled; dropping it reclaims the id.
    pub fn subscribe(&self, id: CorrelationId, timeout: Duration) -> Result<ResponseFuture<T>> {
        let mut pending = self.inner.pending.lock();
        sweep_expired(&mut pending);
        let state = match pending.remove(&id) {
            Some(Slot::Ready { response, .. }) => State::Ready(response),
            Some(Slot::InFlight { .. }) => {
                let (tx, rx) = oneshot::channel();
                pending.insert(id, Slot::Waiting(tx));
                State::Pending {
                    rx,
                    deadline: Instant::now() + timeout,
                    sleep: None,
                }
            }
            Some(waiting @ Slot::Waiting(_)) => {
                pending.insert(id, waiting);
                return Err(RaftError::IllegalCallerState(format!(
                    "request {id} already has a waiter"
                )));
            }
            None => return Err(RaftError::RequestTimeout),
        };
        Ok(ResponseFuture {
            id,
            inner: Arc::clone(&self.inner),
            state,
        })
    }

    /// Wait inline for the response to `id`, up to `timeout`.
    pub async fn wait(&self, id: CorrelationId, timeout: Duration) -> Result<T> {
        self.subscribe(id, timeout)?.await
    }

    /// Forget a request, e.g. because it could not be transmitted.
    pub fn abandon(&self, id: CorrelationId) -> bool {
        self.inner.pending.lock().remove(&id).is_some()
    }

    /// Requests still tracked, after reclaiming expired ones.
    pub fn pending_count(&self) -> usize {
        let mut pending = self.inner.pending.lock();
        sweep_expired(&mut pending);
        pending.len()
    }
}

enum State<T> {
    Ready(T),
    Pending {
        rx: oneshot::Receiver<T>,
        deadline: Instant,
        sleep: Option<Pin<Box<Sleep>>>,
    },
    Done,
}

/// Not-yet-resolved response handle returned by
/// [`CorrelationEngine::subscribe`].
pub struct ResponseFuture<T> {
    id: CorrelationId,
    inner: Arc<Inner<T>>,
    state: State<T>,
}

// The response value is only ever moved out, never pinned.
impl<T> Unpin for ResponseFuture<T> {}

impl<T> ResponseFuture<T> {
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match std::mem::replace(&mut this.state, State::Done) {
            State::Ready(response) => Poll::Ready(Ok(response)),
            State::Done => Poll::Ready(Err(RaftError::IllegalCallerState(format!(
                "response {} polled after completion",
                this.id
            )))),
            State::Pending {
                mut rx,
                deadline,
                sleep,
            } => {
                match Pin::new(&mut rx).poll(cx) {
                    Poll::Ready(Ok(response)) => return Poll::Ready(Ok(response)),
                    Poll::Ready(Err(_)) => return Poll::Ready(Err(RaftError::ConnectionLost)),
                    Poll::Pending => {}
                }

                let mut sleep = sleep.unwrap_or_else(|| Box::pin(tokio::time::sleep_until(deadline)));
                if sleep.as_mut().poll(cx).is_pending() {
                    this.state = State::Pending {
                        rx,
                        deadline,
                        sleep: Some(sleep),
                    };
                    return Poll::Pending;
                }

                // Reclaim the id. A completion that took the lock first has
                // already pushed its value into the channel.
                this.inner.pending.lock().remove(&this.id);
                match rx.try_recv() {
                    Ok(response) => Poll::Ready(Ok(response)),
                    Err(_) => {
                        tracing::trace!(id = %this.id, "Request timed out");
                        Poll::Ready(Err(RaftError::RequestTimeout))
                    }
                }
            }
        }
    }
}

impl<T> Drop for ResponseFuture<T> {
    fn drop(&mut self) {
        if matches!(self.state, State::Pending { .. }) {
            self.inner.pending.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_response_before_waiter_is_not_lost() {
        let engine = CorrelationEngine::<u32>::new();
        let id = engine.allocate(LONG);

        assert!(engine.complete(id, 7));
        let resp = engine.wait(id, Duration::from_millis(10)).await.unwrap();

        assert_eq!(resp, 7);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_after_waiter_registers() {
        let engine = CorrelationEngine::<u32>::new();
        let id = engine.allocate(LONG);

        let completer = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            completer.complete(id, 11);
        });

        let resp = engine.wait(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp, 11);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_reclaims_id_and_drops_late_response() {
        let engine = CorrelationEngine::<u32>::new();
        let id = engine.allocate(LONG);

        let result = engine.wait(id, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(RaftError::RequestTimeout)));
        assert_eq!(engine.pending_count(), 0);

        // Late response has nowhere to go
        assert!(!engine.complete(id, 1));
        assert_eq!(engine.pending_count(), 0);

        // Engine keeps working for later requests
        let next = engine.allocate(LONG);
        assert_ne!(next, id);
        assert!(engine.complete(next, 2));
        assert_eq!(engine.wait(next, Duration::from_millis(10)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_deferred_handle_resolves_later() {
        let engine = CorrelationEngine::<&'static str>::new();
        let id = engine.allocate(LONG);

        // Subscribing does not block
        let handle = engine.subscribe(id, Duration::from_secs(1)).unwrap();
        assert_eq!(handle.id(), id);

        let waiter = tokio::spawn(handle);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.complete(id, "pong"));

        assert_eq!(waiter.await.unwrap().unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_dropping_handle_reclaims_id() {
        let engine = CorrelationEngine::<u32>::new();
        let id = engine.allocate(LONG);

        let handle = engine.subscribe(id, Duration::from_secs(1)).unwrap();
        assert_eq!(engine.pending_count(), 1);
        drop(handle);

        assert_eq!(engine.pending_count(), 0);
        assert!(!engine.complete(id, 3));
    }

    #[tokio::test]
    async fn test_second_waiter_is_rejected() {
        let engine = CorrelationEngine::<u32>::new();
        let id = engine.allocate(LONG);

        let _first = engine.subscribe(id, Duration::from_secs(1)).unwrap();
        let second = engine.subscribe(id, Duration::from_secs(1));
        assert!(matches!(second, Err(RaftError::IllegalCallerState(_))));
    }

    #[tokio::test]
    async fn test_duplicate_response_is_dropped() {
        let engine = CorrelationEngine::<u32>::new();
        let id = engine.allocate(LONG);

        assert!(engine.complete(id, 1));
        assert!(!engine.complete(id, 2));
        assert_eq!(engine.wait(id, Duration::from_millis(10)).await.unwrap(), 1);
    }

    #[test]
    fn test_abandon_and_unknown_id() {
        let engine = CorrelationEngine::<u32>::new();
        let id = engine.allocate(LONG);
        assert!(engine.abandon(id));
        assert!(!engine.abandon(id));
        assert!(matches!(
            engine.subscribe(id, Duration::from_millis(1)),
            Err(RaftError::RequestTimeout)
        ));
    }

    #[test]
    fn test_ids_are_unique() {
        let engine = CorrelationEngine::<u32>::new();
        let ids: HashSet<_> = (0..1000).map(|_| engine.allocate(LONG)).collect();
        assert_eq!(ids.len(), 1000);
        assert_eq!(engine.pending_count(), 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_delivery_races_registration() {
        let engine = CorrelationEngine::<u64>::new();
        let mut tasks = Vec::new();

        for i in 0..200u64 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                let id = engine.allocate(LONG);
                let completer = engine.clone();
                // Delivery and registration race on different workers
                let deliver = tokio::spawn(async move {
                    if i % 2 == 0 {
                        tokio::task::yield_now().await;
                    }
                    completer.complete(id, i);
                });
                let resp = engine.wait(id, Duration::from_secs(5)).await;
                deliver.await.unwrap();
                resp.unwrap() == i
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unclaimed_ids_expire() {
        let engine = CorrelationEngine::<u32>::new();
        let answered = engine.allocate(Duration::from_millis(20));
        let _silent = engine.allocate(Duration::from_millis(20));
        assert!(engine.complete(answered, 5));
        assert_eq!(engine.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Neither the parked response nor the unanswered request survives
        assert_eq!(engine.pending_count(), 0);
        assert!(matches!(
            engine.wait(answered, Duration::from_millis(10)).await,
            Err(RaftError::RequestTimeout)
        ));
    }

    #[tokio::test]
    async fn test_registered_waiter_outlives_allocation_deadline() {
        let engine = CorrelationEngine::<u32>::new();
        let id = engine.allocate(Duration::from_millis(10));
        let handle = engine.subscribe(id, Duration::from_secs(1)).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(engine.pending_count(), 1);
        assert!(engine.complete(id, 8));
        assert_eq!(handle.await.unwrap(), 8);
    }
}
