use std::collections::VecDeque;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

/// Token-bucket gate over a sliding window.
///
/// `capacity` tokens are available per `window`; a consumed token becomes
/// available again exactly one window after it was taken. Waiters are served
/// in FIFO order: the queue behind the internal lock is fair, and the holder
/// sleeps until the head token frees up, so no later caller can overtake.
///
/// Two instances guard a shard: the send limiter bounds every outbound frame,
/// and the identify limiter bounds only identify packets. The latter is
/// typically wrapped in an `Arc` and shared by every shard in the same
/// identify bucket.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    taken: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter allowing `capacity` acquisitions per `window`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or `window` is zero.
    pub fn new(capacity: usize, window: Duration) -> Self {
        assert!(capacity > 0, "rate limiter capacity must be non-zero");
        assert!(!window.is_zero(), "rate limiter window must be non-zero");
        Self {
            capacity,
            window,
            taken: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// The default send limiter: 120 frames per 60 seconds.
    pub fn default_send() -> Self {
        Self::new(120, Duration::from_secs(60))
    }

    /// The default identify limiter: 1 identify per 5 seconds.
    pub fn default_identify() -> Self {
        Self::new(1, Duration::from_secs(5))
    }

    /// Block until a token is available, then consume it.
    pub async fn acquire(&self) {
        let mut taken = self.taken.lock().await;
        loop {
            let now = Instant::now();
            while taken
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                taken.pop_front();
            }
            if taken.len() < self.capacity {
                taken.push_back(now);
                return;
            }
            let Some(oldest) = taken.front().copied() else {
                continue;
            };
            sleep_until(oldest + self.window).await;
        }
    }
}
