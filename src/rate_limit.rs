use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Fixed-window permit gate: at most `max` acquisitions per `window`.
///
/// `acquire()` completes immediately while capacity remains and otherwise
/// suspends until the oldest permit ages out of the window. Permits are never
/// explicitly released; they simply expire.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    taken: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        RateLimiter {
            max,
            window,
            taken: Mutex::new(VecDeque::new()),
        }
    }

    /// Per-account global REST budget. One short of the platform's 50/s so
    /// clock skew never trips the server-side limit.
    pub fn rest_global() -> Self {
        Self::new(49, Duration::from_millis(1000))
    }

    /// Per-connection gateway send budget.
    pub fn gateway_send() -> Self {
        Self::new(120, Duration::from_secs(60))
    }

    /// Take one permit, waiting for a slot if the window is full.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut taken = self.taken.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();

                // Expire permits that have aged out
                while taken
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    taken.pop_front();
                }

                if taken.len() < self.max {
                    taken.push_back(now);
                    None
                } else {
                    // The oldest permit bounds the wait
                    let oldest = *taken.front().expect("window full but empty");
                    Some(self.window - now.duration_since(oldest))
                }
            };

            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Permits currently counted against the window. Diagnostic only.
    pub fn in_flight(&self) -> usize {
        let mut taken = self.taken.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while taken
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            taken.pop_front();
        }
        taken.len()
    }
}
