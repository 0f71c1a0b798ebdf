//! Fixed-delay retry bounded by a deadline.
//!
//! Connection and send loops make their first attempt immediately and then
//! retry every `delay` until the next attempt would land past the deadline.
//!
//! ```ignore
//! let mut attempts = Attempts::within(Duration::from_secs(120), Duration::from_secs(15));
//! while attempts.next().await {
//!     match connect().await {
//!         Ok(conn) => return Ok(conn),
//!         Err(e) => warn!(attempt = attempts.attempt(), error = %e, "Connect failed"),
//!     }
//! }
//! ```

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Attempts {
    delay: Duration,
    deadline: Instant,
    attempt: u32,
}

impl Attempts {
    /// Retry for at most `window` from now.
    pub fn within(window: Duration, delay: Duration) -> Self {
        Self::until(Instant::now() + window, delay)
    }

    /// Retry until an absolute deadline.
    pub fn until(deadline: Instant, delay: Duration) -> Self {
        Self {
            delay,
            deadline,
            attempt: 0,
        }
    }

    /// Wait for the next attempt slot.
    ///
    /// Returns `true` immediately on the first call. Later calls sleep for the
    /// fixed delay and return `true`, or return `false` without sleeping when
    /// the pause would overrun the deadline.
    pub async fn next(&mut self) -> bool {
        if self.attempt > 0 {
            if Instant::now() + self.delay > self.deadline {
                return false;
            }
            tokio::time::sleep(self.delay).await;
        }
        self.attempt += 1;
        true
    }

    /// Number of attempts started so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
