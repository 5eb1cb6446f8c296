//! Single-shot, re-armable inactivity timer

use std::time::Duration;

use tokio::task::JoinHandle;

/// Fires a callback once if not re-armed or cleared within the timeout
///
/// Arming again replaces the pending timer, so the countdown always runs from
/// the most recent activity. Dropping the watchdog clears it.
#[derive(Debug, Default)]
pub struct Watchdog {
    timer: Option<JoinHandle<()>>,
}

impl Watchdog {
    #[must_use]
    pub const fn new() -> Self {
        Self { timer: None }
    }

    /// Start a new countdown, cancelling any previous one
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(&mut self, timeout: Duration, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.clear();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::debug!(?timeout, "watchdog expired");
            on_timeout();
        }));
    }

    /// Cancel the pending countdown; no-op when nothing is armed
    pub fn clear(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Whether a countdown is pending
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.clear();
    }
}
