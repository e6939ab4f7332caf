use crate::exit_reason::ExitReason;
use tracing::warn;

/// Default number of lifecycle attempts, counting the first.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Decision returned by the retry budget after a lifecycle ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Child exited with code 0. Stop regardless of remaining budget.
    Succeeded,
    /// Lifecycle failed and budget remains. Launch again (1-based attempt number).
    Retry { attempt: u32 },
    /// Lifecycle failed and no budget remains.
    Exhausted,
}

/// Retry budget for failed, killed, or unresolved lifecycles.
///
/// `max_attempts` counts every lifecycle including the first, so a budget of
/// N forks the child at most N times.
pub struct RetryBudget {
    max_attempts: u32,
    failures: u32,
}

impl RetryBudget {
    /// A budget of zero is treated as one attempt.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            failures: 0,
        }
    }

    /// Evaluate a finished lifecycle and decide what to do next.
    pub fn evaluate(&mut self, reason: &ExitReason) -> RetryDecision {
        if reason.succeeded() {
            return RetryDecision::Succeeded;
        }

        self.failures += 1;

        if self.failures < self.max_attempts {
            warn!(
                pid = reason.pid,
                attempt = self.failures,
                max_attempts = self.max_attempts,
                %reason,
                "child lifecycle failed, retrying"
            );
            RetryDecision::Retry {
                attempt: self.failures + 1,
            }
        } else {
            warn!(
                pid = reason.pid,
                max_attempts = self.max_attempts,
                %reason,
                "child lifecycle failed, retries exhausted"
            );
            RetryDecision::Exhausted
        }
    }

    /// Attempts still available, including one in progress.
    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.failures)
    }

    #[allow(dead_code)]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
