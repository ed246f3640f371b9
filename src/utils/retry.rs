use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::{ErrorCategory, ItemError, TransferError};

/// Attempts allowed per error category before an item fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryBudgets {
    pub network: u32,
    pub server: u32,
    pub quota: u32,
    pub validation: u32,
    pub unknown: u32,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            network: 5,
            server: 3,
            quota: 0,
            validation: 0,
            unknown: 0,
        }
    }
}

impl RetryBudgets {
    pub fn for_category(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::Network => self.network,
            ErrorCategory::Server => self.server,
            ErrorCategory::Quota => self.quota,
            ErrorCategory::Validation => self.validation,
            ErrorCategory::Unknown => self.unknown,
        }
    }
}

/// Classify a collaborator failure.
///
/// Order matters: transport first, then quota, then 4xx, then 5xx.
pub fn classify(error: &TransferError) -> ErrorCategory {
    match error {
        TransferError::Network(_) => ErrorCategory::Network,
        TransferError::QuotaExceeded(_) => ErrorCategory::Quota,
        TransferError::Validation(_) => ErrorCategory::Validation,
        TransferError::Http { status, message } => classify_status(*status, message),
        TransferError::Other(message) if mentions_quota(message) => ErrorCategory::Quota,
        TransferError::Cancelled | TransferError::Other(_) => ErrorCategory::Unknown,
    }
}

fn classify_status(status: u16, message: &str) -> ErrorCategory {
    match status {
        // request timeout is a transport problem, not a bad request
        408 => ErrorCategory::Network,
        413 | 507 => ErrorCategory::Quota,
        _ if mentions_quota(message) => ErrorCategory::Quota,
        429 => ErrorCategory::Server,
        400..=499 => ErrorCategory::Validation,
        500..=599 => ErrorCategory::Server,
        _ => ErrorCategory::Unknown,
    }
}

fn mentions_quota(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("quota") || message.contains("storage limit") || message.contains("insufficient storage")
}

/// Build the item-facing error for a classified failure.
pub fn item_error(error: &TransferError) -> ItemError {
    ItemError::new(classify(error), error.to_string()).with_status(error.status())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue with the new failure count for the category after `delay`
    Retry {
        failures: u32,
        delay: Duration,
    },
    GiveUp,
}

/// Per-category budgets with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub budgets: RetryBudgets,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budgets: RetryBudgets::default(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(budgets: RetryBudgets, base_delay: Duration, max_delay: Duration) -> Self {
        Self { budgets, base_delay, max_delay }
    }

    /// `failures` is how often the item already failed in `category`.
    ///
    /// The failing attempt is counted first; the item is re-queued only while
    /// that count stays below the category budget, so a category's count
    /// never exceeds its budget.
    pub fn decide(&self, category: ErrorCategory, failures: u32) -> RetryDecision {
        let budget = self.budgets.for_category(category);
        if budget == 0 {
            return RetryDecision::GiveUp;
        }

        let attempts = failures.saturating_add(1);
        if attempts >= budget {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry {
            failures: attempts,
            delay: self.delay_for(attempts),
        }
    }

    /// `base_delay * 2^retry_count`, capped at `max_delay`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(20));
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    /// Category count to record when giving up. Categories without a budget
    /// are never retried, so their failures are not counted.
    pub fn exhausted_count(&self, category: ErrorCategory, failures: u32) -> u32 {
        let budget = self.budgets.for_category(category);
        if budget == 0 {
            failures
        } else {
            failures.saturating_add(1).min(budget)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FileInput, UploadItem, UploadRequest};

    #[test]
    fn test_classify_transport_and_quota() {
        assert_eq!(classify(&TransferError::network("connection reset")), ErrorCategory::Network);
        assert_eq!(classify(&TransferError::QuotaExceeded("full".into())), ErrorCategory::Quota);
        assert_eq!(classify(&TransferError::from_status(413, "too large")), ErrorCategory::Quota);
        assert_eq!(classify(&TransferError::from_status(403, "Storage quota exceeded")), ErrorCategory::Quota);
        assert_eq!(classify(&TransferError::other("user quota reached")), ErrorCategory::Quota);
    }

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(classify(&TransferError::from_status(400, "Bad Request")), ErrorCategory::Validation);
        assert_eq!(classify(&TransferError::from_status(422, "invalid")), ErrorCategory::Validation);
        assert_eq!(classify(&TransferError::from_status(408, "timeout")), ErrorCategory::Network);
        assert_eq!(classify(&TransferError::from_status(429, "slow down")), ErrorCategory::Server);
        assert_eq!(classify(&TransferError::from_status(500, "boom")), ErrorCategory::Server);
        assert_eq!(classify(&TransferError::from_status(503, "unavailable")), ErrorCategory::Server);
        assert_eq!(classify(&TransferError::from_status(302, "moved")), ErrorCategory::Unknown);
        assert_eq!(classify(&TransferError::other("weird")), ErrorCategory::Unknown);
    }

    #[test]
    fn test_server_budget_gives_up_at_three() {
        let policy = RetryPolicy::default();

        let mut failures = 0;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match policy.decide(ErrorCategory::Server, failures) {
                RetryDecision::Retry { failures: next, .. } => failures = next,
                RetryDecision::GiveUp => {
                    failures = policy.exhausted_count(ErrorCategory::Server, failures);
                    break;
                }
            }
        }

        assert_eq!(attempts, 3);
        assert_eq!(failures, 3);
    }

    #[test]
    fn test_non_retryable_categories() {
        let policy = RetryPolicy::default();

        for category in [ErrorCategory::Quota, ErrorCategory::Validation, ErrorCategory::Unknown] {
            assert_eq!(policy.decide(category, 0), RetryDecision::GiveUp);
            assert_eq!(policy.exhausted_count(category, 0), 0);
        }
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::new(
            RetryBudgets::default(),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));

        match policy.decide(ErrorCategory::Network, 1) {
            RetryDecision::Retry { failures, delay } => {
                assert_eq!(failures, 2);
                assert_eq!(delay, Duration::from_millis(400));
            }
            RetryDecision::GiveUp => panic!("network budget should allow a retry"),
        }
    }

    #[test]
    fn test_budgets_are_counted_per_category() {
        let policy = RetryPolicy::default();
        let file = FileInput::new("a.jpg", "image/jpeg", vec![0u8; 16]);
        let mut item = UploadItem::new(&file, &UploadRequest::new("collection", "col-1"), 0);

        let mut attempts = 0;
        let mut sequence = vec![ErrorCategory::Network; 4];
        sequence.extend([ErrorCategory::Server; 3]);
        for category in sequence {
            attempts += 1;
            match policy.decide(category, item.failures_in(category)) {
                RetryDecision::Retry { failures, .. } => item.record_failures(category, failures),
                RetryDecision::GiveUp => {
                    let failures = policy.exhausted_count(category, item.failures_in(category));
                    item.record_failures(category, failures);
                    break;
                }
            }
        }

        // four network failures leave the whole server budget intact
        assert_eq!(attempts, 7);
        assert_eq!(item.failures_in(ErrorCategory::Network), 4);
        assert_eq!(item.failures_in(ErrorCategory::Server), 3);
        assert_eq!(item.retry_count, 7);

        // a lower count is ignored
        item.record_failures(ErrorCategory::Network, 1);
        assert_eq!(item.retry_count, 7);

        item.reset_failures();
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.failures_in(ErrorCategory::Server), 0);
    }
}
