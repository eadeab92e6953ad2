//! Bounded polling.

use std::future::Future;
use std::time::Duration;
use tokio::time;

/// How many checks to make and how long to wait before each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollBudget {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }
}

/// Run `check` up to `budget.attempts` times, sleeping `budget.interval`
/// before each call, and stop at the first `true`.
pub async fn poll_until<F, Fut>(budget: PollBudget, mut check: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=budget.attempts {
        time::sleep(budget.interval).await;
        if check().await {
            return PollOutcome::Ready { attempts: attempt };
        }
    }
    PollOutcome::TimedOut {
        attempts: budget.attempts,
    }
}
