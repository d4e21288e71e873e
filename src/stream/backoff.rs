use std::time::Duration;

/// Capped exponential reconnect schedule.
///
/// `delay = min(base * 2^attempts, cap)`. Once `max_attempts` delays have been
/// handed out the schedule reports exhaustion; the caller waits `cooldown` and
/// calls [`Backoff::reset`] to start the cycle again.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    cooldown: Duration,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextDelay {
    Retry(Duration),
    Exhausted { cooldown: Duration },
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            max_attempts: max_attempts.max(1),
            cooldown,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay for a given attempt number without advancing the schedule.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap)
    }

    pub fn next_delay(&mut self) -> NextDelay {
        if self.attempts >= self.max_attempts {
            return NextDelay::Exhausted { cooldown: self.cooldown };
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        NextDelay::Retry(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
