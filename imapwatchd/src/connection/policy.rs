use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(300);
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(60);

/// Fixed-interval retry policy for opening a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    timeout: Duration,
    max_attempts: u32,
    stable_after: Duration,
}

impl ReconnectPolicy {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            timeout,
            max_attempts,
            stable_after: DEFAULT_STABLE_AFTER,
        }
    }

    /// Connections that fault sooner than `stable_after` after opening count
    /// against the attempt budget of the next reconnect cycle.
    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    pub fn stable_after(&self) -> Duration {
        self.stable_after
    }

    /// Delay before the attempt following `attempt`. Always the configured
    /// timeout, with no growth and no jitter.
    pub fn delay(&self, _attempt: u32) -> Duration {
        self.timeout
    }

    /// Total attempts a connect cycle makes before giving up. Never zero.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ATTEMPTS)
    }
}
