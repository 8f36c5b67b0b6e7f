//! Rate limiting for calls to the external record source

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;

/// Length of one rate window
pub const RATE_WINDOW: Duration = Duration::from_millis(1000);

/// Fixed-window request limiter.
///
/// Allows at most `requests_per_second` dispatches before forcing the caller
/// to wait out the remainder of the current window. The counter only resets
/// when the limit is hit, so crossing a window boundary below the limit never
/// suspends.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    window: Mutex<WindowState>,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    request_count: u32,
    last_request_time: DateTime<Utc>,
}

impl RateLimiter {
    /// Create a new rate limiter; the first window starts now
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let last_request_time = clock.now();
        Self {
            clock,
            window: Mutex::new(WindowState { request_count: 0, last_request_time }),
        }
    }

    /// Wait until one more request is allowed under `requests_per_second`
    pub async fn acquire(&self, requests_per_second: u32) {
        let limit = requests_per_second.max(1);
        let mut window = self.window.lock().await;

        if window.request_count >= limit {
            let elapsed = (self.clock.now() - window.last_request_time)
                .to_std()
                .unwrap_or(Duration::ZERO);

            if elapsed < RATE_WINDOW {
                let wait = RATE_WINDOW - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, limit, "rate limit reached, waiting");
                self.clock.sleep(wait).await;
            }

            window.request_count = 0;
            window.last_request_time = self.clock.now();
        }

        window.request_count += 1;
    }

    /// Run `call` once a request slot is available.
    ///
    /// Errors from `call` are returned untouched.
    pub async fn call<F, Fut, T>(&self, requests_per_second: u32, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(requests_per_second).await;
        call().await
    }

    /// Snapshot of the current window
    pub async fn info(&self) -> RateLimitInfo {
        let window = self.window.lock().await;
        RateLimitInfo {
            request_count: window.request_count,
            window_started_at: window.last_request_time,
        }
    }
}

/// Rate limit window information
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// Requests dispatched in the current window
    pub request_count: u32,

    /// When the current window started
    pub window_started_at: DateTime<Utc>,
}
