//! Rendezvous queue: a bounded-less handoff between producers and consumers
//! of `T`, with FIFO pairing on both sides and close-cancels-all semantics.
//!
//! This is the Rust shape of the original `waitqueue<R>` (asio coroutine
//! version): where that type posted completion handlers through an
//! executor, here a waiter/provider pairs by completing a `oneshot` channel
//! directly, under a short-lived `std::sync::Mutex` that is never held
//! across an `.await`.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

struct Inner<T> {
    waiters: VecDeque<oneshot::Sender<T>>,
    providers: VecDeque<(T, oneshot::Sender<()>)>,
    closed: bool,
}

/// A typed handoff channel. `wait()` suspends until a `provide()` arrives
/// (or the queue is closed); `provide()` suspends until a `wait()` accepts
/// the item (or the queue is closed).
pub struct Rendezvous<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Rendezvous<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiters: VecDeque::new(),
                providers: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Suspend until an item is available or the queue is closed.
    pub async fn wait(&self) -> Result<T> {
        let rx = {
            let mut inner = self.inner.lock().expect("rendezvous mutex poisoned");
            if inner.closed {
                return Err(Error::Cancelled);
            }
            if let Some((item, completed)) = inner.providers.pop_front() {
                let _ = completed.send(());
                return Ok(item);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Suspend until a waiter accepts `item`, or the queue is closed.
    pub async fn provide(&self, item: T) -> Result<()> {
        let rx = {
            let mut inner = self.inner.lock().expect("rendezvous mutex poisoned");
            if inner.closed {
                return Err(Error::Cancelled);
            }
            if let Some(waiter) = inner.waiters.pop_front() {
                // If the waiter already dropped its receiver there is no
                // pending `wait()` to deliver to; treat the item as
                // undelivered and fall through to queueing it for the next
                // waiter instead of silently discarding it.
                match waiter.send(item) {
                    Ok(()) => return Ok(()),
                    Err(item) => {
                        let (tx, rx) = oneshot::channel();
                        inner.providers.push_back((item, tx));
                        rx
                    }
                }
            } else {
                let (tx, rx) = oneshot::channel();
                inner.providers.push_back((item, tx));
                rx
            }
        };
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Wake every pending waiter and provider with `cancelled`; all
    /// subsequent `wait`/`provide` calls also fail with `cancelled`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("rendezvous mutex poisoned");
        inner.closed = true;
        inner.waiters.clear();
        inner.providers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn provide_then_wait_pairs_fifo() {
        let q: Arc<Rendezvous<i32>> = Arc::new(Rendezvous::new());
        let q2 = q.clone();
        let provider = tokio::spawn(async move {
            q2.provide(1).await.unwrap();
            q2.provide(2).await.unwrap();
        });
        assert_eq!(q.wait().await.unwrap(), 1);
        assert_eq!(q.wait().await.unwrap(), 2);
        provider.await.unwrap();
    }

    #[tokio::test]
    async fn wait_then_provide_pairs() {
        let q: Arc<Rendezvous<&'static str>> = Arc::new(Rendezvous::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.wait().await.unwrap() });
        // give the waiter a chance to register before providing
        tokio::task::yield_now().await;
        q.provide("hello").await.unwrap();
        assert_eq!(waiter.await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn close_cancels_pending_wait() {
        let q: Arc<Rendezvous<i32>> = Arc::new(Rendezvous::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.wait().await });
        tokio::task::yield_now().await;
        q.close();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn close_cancels_pending_provide() {
        let q: Arc<Rendezvous<i32>> = Arc::new(Rendezvous::new());
        let q2 = q.clone();
        let provider = tokio::spawn(async move { q2.provide(42).await });
        tokio::task::yield_now().await;
        q.close();
        assert!(matches!(provider.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn operations_after_close_fail_immediately() {
        let q: Rendezvous<i32> = Rendezvous::new();
        q.close();
        assert!(matches!(q.wait().await, Err(Error::Cancelled)));
        assert!(matches!(q.provide(1).await, Err(Error::Cancelled)));
    }
}
