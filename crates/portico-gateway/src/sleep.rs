//! Auto-sleep: shut the gateway down after a period without end-user requests.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Tracks end-user activity against an idle threshold. A zero threshold
/// disables auto-sleep.
pub struct IdleMonitor {
    threshold: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl IdleMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_request: Mutex::new(None),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.threshold.is_zero()
    }

    /// Record an end-user request.
    pub fn touch(&self) {
        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Time since the last request, if there has been one.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.last_request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| now.saturating_duration_since(t))
    }

    pub fn should_sleep(&self, now: Instant) -> bool {
        self.enabled() && self.idle_for(now).is_some_and(|idle| idle >= self.threshold)
    }

    /// Resolve once the gateway has been idle for the threshold.
    ///
    /// Checks every threshold period. Never resolves when disabled, and
    /// stays armed but inert until the first request has been seen.
    pub async fn wait_until_idle(&self) {
        if !self.enabled() {
            std::future::pending::<()>().await;
        }

        let mut ticker = tokio::time::interval(self.threshold);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let idle = self.idle_for(now);
            if self.should_sleep(now) {
                let idle_minutes = idle.map_or(0, |idle| idle.as_secs() / 60);
                info!(idle_minutes, "idle threshold reached, going to sleep");
                return;
            }
            match idle {
                Some(idle) => debug!(idle_secs = idle.as_secs(), "gateway active"),
                None => debug!("no requests seen yet"),
            }
        }
    }
}
