use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DependencyCode;
use crate::model::{RunContext, StageOutcome, StageResult, StageStatus};

/// Everything a retry decision may look at after one attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryInput<'a> {
    pub stage: &'a str,
    pub context: &'a RunContext,
    pub outcome: &'a StageOutcome,
    pub result: &'a StageResult,
    pub attempt: u32,
    pub retries: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryDecision {
    pub retry: bool,
    /// Overrides the result's `retry_after_ms` and the configured base delay.
    pub delay: Option<Duration>,
}

impl RetryDecision {
    pub fn stop() -> Self {
        Self::default()
    }

    pub fn retry() -> Self {
        Self {
            retry: true,
            delay: None,
        }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self {
            retry: true,
            delay: Some(delay),
        }
    }
}

/// Custom retry decision. Not bounded by `max_retries` unless it checks it.
pub type RetryPolicyFn = Arc<dyn Fn(&RetryInput<'_>) -> RetryDecision + Send + Sync>;

/// Per-attempt timeout: `(stage, context, attempt)`.
pub type TimeoutResolverFn = Arc<dyn Fn(&str, &RunContext, u32) -> Option<Duration> + Send + Sync>;

pub fn classify(result: &StageResult, dependency_codes: &HashSet<DependencyCode>) -> StageStatus {
    let dependency_blocked = result
        .code
        .as_deref()
        .and_then(DependencyCode::parse)
        .is_some_and(|code| dependency_codes.contains(&code));
    if result.blocked || dependency_blocked {
        StageStatus::Blocked
    } else if result.skip {
        StageStatus::Skipped
    } else if result.ok {
        StageStatus::Completed
    } else {
        StageStatus::Failed
    }
}

/// Retry failed attempts the handler marked retryable (or gave a retry-after
/// hint for) while under `max_retries`.
pub fn default_retry_decision(input: &RetryInput<'_>) -> RetryDecision {
    let eligible = input.outcome.status == StageStatus::Failed
        && (input.result.retryable || input.result.retry_after_ms.is_some());
    if eligible && input.retries < input.max_retries {
        RetryDecision::retry()
    } else {
        RetryDecision::stop()
    }
}

pub(crate) fn retry_delay(
    decision: &RetryDecision,
    result: &StageResult,
    base_delay_ms: u64,
) -> Duration {
    decision
        .delay
        .or_else(|| result.retry_after_ms.map(Duration::from_millis))
        .unwrap_or_else(|| Duration::from_millis(base_delay_ms))
}
