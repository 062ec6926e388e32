use crate::settings::EngineSettings;
use std::time::Duration;

/// Exponential backoff bounded by a total elapsed budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Cumulative budget across all attempts of one step
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            initial_backoff: settings.retry_initial_backoff(),
            max_backoff: settings.retry_max_backoff(),
            max_elapsed: settings.task_retry_duration(),
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from `initial_backoff`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Delay to wait before the next attempt, or `None` once the budget is spent.
    ///
    /// The delay is clipped so that the next attempt still starts inside the budget.
    pub fn next_delay(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        let remaining = self.max_elapsed.checked_sub(elapsed)?;
        if remaining.is_zero() {
            return None;
        }
        Some(self.backoff(attempt).min(remaining))
    }

    /// Same policy with the budget shortened to `limit`
    pub fn capped(mut self, limit: Duration) -> Self {
        self.max_elapsed = self.max_elapsed.min(limit);
        self
    }
}
