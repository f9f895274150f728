use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::provider::ProviderError;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    Create,
    Exists,
    Delete,
    Publish,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let message = match self {
            Operation::Create => "create",
            Operation::Exists => "exists",
            Operation::Delete => "delete",
            Operation::Publish => "publish",
        };
        write!(f, "{}", message)
    }
}

/// Backoff applied to every provider call.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-call timeout; an elapsed call counts as a retryable failure.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// A create that timed out may still have succeeded on the provider side,
/// leaving a resource nothing tracks once the call is retried.
pub fn may_leak(operation: Operation, error: &ProviderError) -> bool {
    operation == Operation::Create && matches!(error, ProviderError::Timeout(_))
}

/// Runs one provider call under the retry policy.
///
/// Throttling, transient failures and timeouts are retried with exponential
/// backoff and jitter; anything else is returned on the first occurrence.
pub async fn perform_operation<F, Fut, T>(
    policy: &RetryPolicy,
    operation: Operation,
    target: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    let mut delay = policy.base_delay;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(policy.call_timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if may_leak(operation, &e) {
                    warn!(
                        operation = %operation,
                        target = %target,
                        attempt = attempt,
                        "Create timed out; the provider may hold an untracked resource from this attempt"
                    );
                }
                if attempt >= policy.max_attempts {
                    error!(
                        operation = %operation,
                        target = %target,
                        attempt = attempt,
                        error = %e,
                        "Provider call failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation,
                    target = %target,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "Provider call failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * 2.0).min(policy.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
