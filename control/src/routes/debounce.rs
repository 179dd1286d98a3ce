//! Trailing-edge debounce for Ingress resyncs
//!
//! A trigger sets the deadline to `now + window`; later triggers push the
//! deadline out. `settled()` resolves once, when the deadline passes without
//! another trigger, and clears the pending state.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadline: Mutex<Option<Instant>>,
    notify: Notify,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Arm the timer, or postpone it if already armed
    pub fn trigger(&self) {
        *self.lock() = Some(Instant::now() + self.window);
        self.notify.notify_one();
    }

    /// Drop a pending deadline without firing
    pub fn cancel(&self) {
        *self.lock() = None;
        self.notify.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        self.lock().is_some()
    }

    /// Wait until a burst of triggers has settled
    pub async fn settled(&self) {
        loop {
            let deadline = *self.lock();
            match deadline {
                None => self.notify.notified().await,
                Some(deadline) if Instant::now() < deadline => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                Some(_) => {
                    let mut pending = self.lock();
                    // re-check: a trigger may have landed since the read above
                    if matches!(*pending, Some(d) if Instant::now() >= d) {
                        *pending = None;
                        return;
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }
}
