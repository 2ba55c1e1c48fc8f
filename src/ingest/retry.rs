//! Bounded retry for index submissions.
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::IngestError;
use crate::index::{IndexError, VectorIndex};
use crate::models::Chunk;

/// Failure signatures worth another attempt: timeouts, 5xx responses,
/// dropped connections.
static TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)timeout|timed out|\b50[0-4]\b|server error|connection reset|\beof\b").unwrap()
});

/// Whether `err` carries a recognized transient signature.
pub fn is_transient(err: &IndexError) -> bool {
    TRANSIENT.is_match(&err.to_string())
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Submit `chunks`, retrying transient failures up to the policy limit.
///
/// Returns the number of attempts it took. Cancellation during a pause
/// aborts immediately.
pub async fn submit_with_retry(
    index: &dyn VectorIndex,
    chunks: &[Chunk],
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
) -> Result<u32, IngestError> {
    with_retry(policy, cancel, label, || index.add(chunks))
        .await
        .map(|((), attempts)| attempts)
}

/// Run an index operation under `policy`; yields its value and the attempt count.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<(T, u32), IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IndexError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match op().await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) => e,
        };

        if !is_transient(&err) {
            return Err(IngestError::Permanent {
                attempts: attempt,
                source: err,
            });
        }
        if attempt >= max_attempts {
            return Err(IngestError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        warn!(
            attempt,
            max_attempts,
            file = label,
            "Index operation failed, retrying in {}ms: {err}",
            policy.delay.as_millis()
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(IngestError::Interrupted),
            _ = tokio::time::sleep(policy.delay) => {}
        }
        attempt += 1;
    }
}
