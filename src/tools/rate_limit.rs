//! Process-wide spacing between outbound web requests.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between any two outbound requests, no matter
/// which worker issues them.
///
/// The lock is held while sleeping, so concurrent callers queue up and are
/// released one interval apart.
#[derive(Debug)]
pub struct FetchRateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl FetchRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until a request may be sent, then claim the slot.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
