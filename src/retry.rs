//! Error classification and bounded retry.
//!
//! Failures from the model provider (and any other transient operation) are
//! classified by substring into one of six categories; retryable categories
//! are re-attempted with exponential backoff up to the configured cap, and
//! the final categorized error is surfaced so the caller can pick a recovery
//! action.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetryStrategy;
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Network,
    Timeout,
    UserInputRequired,
    Fatal,
    Recoverable,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::UserInputRequired => "user_input_required",
            ErrorCategory::Fatal => "fatal",
            ErrorCategory::Recoverable => "recoverable",
        }
    }

    /// Classify an error message by case-insensitive substring match.
    /// Categories are checked in a fixed order; the first match wins.
    pub fn classify(message: &str) -> ErrorCategory {
        let lowered = message.to_lowercase();
        const TABLE: &[(ErrorCategory, &[&str])] = &[
            (ErrorCategory::RateLimit, &["rate limit", "429"]),
            (
                ErrorCategory::Network,
                &["network", "econnrefused", "fetch failed"],
            ),
            (ErrorCategory::Timeout, &["timeout", "timed out"]),
            (
                ErrorCategory::UserInputRequired,
                &["captcha", "verification", "login required", "authentication"],
            ),
            (
                ErrorCategory::Fatal,
                &["forbidden", "unauthorized", "invalid session"],
            ),
        ];
        for (category, needles) in TABLE {
            if needles.iter().any(|needle| lowered.contains(needle)) {
                return *category;
            }
        }
        ErrorCategory::Recoverable
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Recoverable
        )
    }

    /// Recovery action once retries are exhausted (or for non-retryable
    /// categories, immediately).
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            ErrorCategory::UserInputRequired => RecoveryAction::Pause,
            ErrorCategory::Fatal => RecoveryAction::Abort,
            ErrorCategory::Recoverable => RecoveryAction::Skip,
            ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Timeout => {
                RecoveryAction::Abort
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Pause,
    Skip,
    Abort,
    AskUser,
}

/// Result of a successful retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Total attempts made, including the first.
    pub attempts: u32,
}

/// Run `op`, retrying retryable failures with exponential backoff.
///
/// The operation is attempted once plus up to `strategy.max_retries` more
/// times when the classified category is retryable under the strategy. The
/// last error is returned re-wrapped with its category attached.
pub async fn execute_with_retry<T, F, Fut>(
    mut op: F,
    strategy: &RetryStrategy,
    ctx: &str,
) -> EngineResult<RetryOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(RetryOutcome { value, attempts }),
            Err(err) => {
                let category = err.category();
                let retries_used = attempts - 1;
                if !strategy.is_retryable(category) || retries_used >= strategy.max_retries {
                    warn!(
                        ctx,
                        %category,
                        attempts,
                        error = %err,
                        "operation failed after retries"
                    );
                    return Err(EngineError::categorized(category, err.to_string()));
                }
                let delay = strategy.backoff_delay_ms(attempts);
                debug!(ctx, %category, attempt = attempts, delay_ms = delay, "retrying after backoff");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}
