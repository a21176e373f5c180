//! Outgoing request rate limiting using a sliding window.
//!
//! Keeps the timestamps of requests sent in the last [`WINDOW`]. Before a
//! request is written the client calls [`RequestRateLimiter::acquire`],
//! which sleeps until the window has room and then records the request.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// The sliding window duration.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Caps outgoing requests to a fixed number per [`WINDOW`].
#[derive(Debug)]
pub struct RequestRateLimiter {
    max_per_window: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl RequestRateLimiter {
    /// Limit to `max_per_second` requests per second. Zero disables the cap.
    pub fn per_second(max_per_second: u32) -> Self {
        Self::with_window(max_per_second as usize, WINDOW)
    }

    pub fn with_window(max_per_window: usize, window: Duration) -> Self {
        Self { max_per_window, window, sent: VecDeque::with_capacity(max_per_window) }
    }

    fn prune(&mut self, now: Instant) {
        while self.sent.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            self.sent.pop_front();
        }
    }

    /// Returns `true` if a request may be sent now.
    pub fn check(&mut self) -> bool {
        if self.max_per_window == 0 {
            return true;
        }
        self.prune(Instant::now());
        self.sent.len() < self.max_per_window
    }

    /// Record a request sent now.
    pub fn record(&mut self) {
        if self.max_per_window > 0 {
            self.sent.push_back(Instant::now());
        }
    }

    /// How long until the window has room. Zero when it already does.
    pub fn wait_time(&mut self) -> Duration {
        if self.check() {
            return Duration::ZERO;
        }
        let now = Instant::now();
        self.sent
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Block until a request may be sent, then record it.
    pub fn acquire(&mut self) {
        loop {
            let wait = self.wait_time();
            if wait.is_zero() {
                break;
            }
            debug!(wait_ms = wait.as_millis() as u64, limit = self.max_per_window,
                "rate_limiter: request ceiling reached");
            thread::sleep(wait);
        }
        self.record();
    }

    /// Requests currently counted in the window.
    pub fn in_window(&mut self) -> usize {
        self.prune(Instant::now());
        self.sent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit() {
        let mut rl = RequestRateLimiter::with_window(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(rl.check());
            rl.record();
        }
        assert!(!rl.check());
        assert!(rl.wait_time() > Duration::ZERO);
    }

    #[test]
    fn zero_disables_cap() {
        let mut rl = RequestRateLimiter::per_second(0);
        for _ in 0..100 {
            rl.acquire();
        }
        assert!(rl.check());
        assert_eq!(rl.in_window(), 0);
    }

    #[test]
    fn window_expiry_frees_slots() {
        let mut rl = RequestRateLimiter::with_window(1, Duration::from_millis(20));
        rl.acquire();
        assert!(!rl.check());
        thread::sleep(Duration::from_millis(30));
        assert!(rl.check());
    }

    #[test]
    fn acquire_blocks_until_room() {
        let window = Duration::from_millis(50);
        let mut rl = RequestRateLimiter::with_window(2, window);
        let start = Instant::now();
        rl.acquire();
        rl.acquire();
        rl.acquire();
        assert!(start.elapsed() >= window);
        assert!(rl.in_window() <= 2);
    }
}
