//! Deadline timers and cooperative timeouts.
//!
//! Mirrors the original's `steady_timer` idiom: a deadline defaults to
//! "disabled" (expiry pushed to infinity); arming it schedules a future
//! expiry; a companion loop (`wait_expired`) observes the *current* expiry
//! and returns once it has actually elapsed, re-checking whenever the
//! deadline is rearmed in the meantime (a `Notify` wakes the sleeper early
//! so it can recompute, the same way resetting an asio `steady_timer`
//! implicitly cancels any pending `async_wait`).

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub struct Deadline {
    expiry: Mutex<Option<Instant>>,
    notify: Notify,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

impl Deadline {
    pub fn new() -> Self {
        Self {
            expiry: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Arm the deadline to fire `after` from now.
    pub fn arm(&self, after: Duration) {
        *self.expiry.lock().expect("deadline mutex poisoned") = Some(Instant::now() + after);
        self.notify.notify_one();
    }

    /// Disable the deadline (push its expiry to infinity).
    pub fn disable(&self) {
        *self.expiry.lock().expect("deadline mutex poisoned") = None;
        self.notify.notify_one();
    }

    /// Suspend until the currently-armed deadline elapses. Returns
    /// immediately, forever, if the deadline is disabled and never rearmed.
    pub async fn wait_expired(&self) {
        loop {
            let expiry = *self.expiry.lock().expect("deadline mutex poisoned");
            match expiry {
                None => {
                    self.notify.notified().await;
                }
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            // Re-check: a rearm could have raced the sleep's
                            // completion with a fresh expiry already installed.
                            let still = *self.expiry.lock().expect("deadline mutex poisoned");
                            if still == Some(at) && Instant::now() >= at {
                                return;
                            }
                        }
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }
}

/// Race `fut` against a timer of duration `dur`; on timer expiry, cancel
/// `token` and return [`Error::Cancelled`]; on `fut` completion, the timer is
/// simply dropped.
pub async fn with_timeout<F, T>(fut: F, token: &CancellationToken, dur: Duration) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        res = fut => res,
        _ = tokio::time::sleep(dur) => {
            token.cancel();
            Err(Error::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn disabled_deadline_never_expires_until_armed() {
        let d = Deadline::new();
        let handle = tokio::spawn(async move {
            d.wait_expired().await;
        });
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn armed_deadline_expires_after_duration() {
        let d = std::sync::Arc::new(Deadline::new());
        d.arm(Duration::from_secs(5));
        let d2 = d.clone();
        let handle = tokio::spawn(async move { d2.wait_expired().await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_postpones_expiry() {
        let d = std::sync::Arc::new(Deadline::new());
        d.arm(Duration::from_secs(2));
        let d2 = d.clone();
        let handle = tokio::spawn(async move { d2.wait_expired().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        d.arm(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!handle.is_finished());
        tokio::time::sleep(Duration::from_secs(4)).await;
        handle.await.unwrap();
    }
}
