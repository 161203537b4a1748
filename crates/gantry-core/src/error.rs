use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Error kinds surfaced across the orchestrator.
///
/// Retryable kinds (`RateLimited`, `Transient`) are retried with bounded
/// jittered backoff by their subsystem owner; everything else terminates at
/// the boundary that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GantryError {
    #[error("Invalid signature")]
    SignatureInvalid,
    #[error("unknown installation: {0}")]
    UnknownInstallation(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("sandbox failure: {0}")]
    SandboxFailure(String),
    #[error("circular dependency: {0}")]
    CircularDependency(String),
    #[error("cancelled")]
    Cancelled,
}

impl GantryError {
    /// Stable kind string used in API envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignatureInvalid => "SignatureInvalid",
            Self::UnknownInstallation(_) => "UnknownInstallation",
            Self::MalformedPayload(_) => "MalformedPayload",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::RateLimited(_) => "RateLimited",
            Self::Transient(_) => "Transient",
            Self::SandboxFailure(_) => "SandboxFailure",
            Self::CircularDependency(_) => "CircularDependency",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::SignatureInvalid => 401,
            Self::UnknownInstallation(_) | Self::MalformedPayload(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::CircularDependency(_) => 409,
            Self::RateLimited(_) => 429,
            Self::Transient(_) | Self::SandboxFailure(_) => 502,
            Self::Cancelled => 499,
        }
    }
}

/// Kind string for an arbitrary error chain (falls back to "Internal").
pub fn kind_of(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<GantryError>()
        .map(GantryError::kind)
        .unwrap_or("Internal")
}

/// Exponential backoff delay for `attempt` (1-based), with jitter.
///
/// Grows `base_ms * 2^(attempt-1)`, capped at 60s; the returned delay is a
/// uniform sample from [half, full] so retrying callers decorrelate.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let capped = exp.min(60_000).max(1);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped / 2 + jitter)
}

/// Run `op` up to `max_attempts` times, sleeping between attempts.
///
/// Only errors whose chain carries a retryable [`GantryError`] are retried;
/// anything else is returned on the first failure.
pub async fn retry_with_backoff<T, Fut, F>(
    max_attempts: u32,
    base_ms: u64,
    what: &str,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                let retryable = e
                    .downcast_ref::<GantryError>()
                    .map(GantryError::is_retryable)
                    .unwrap_or(false);
                if !retryable || attempt >= max_attempts {
                    return Err(e);
                }
                let delay = backoff_delay(base_ms, attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "{what}: retrying after {e}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(GantryError::RateLimited("x".into()).is_retryable());
        assert!(GantryError::Transient("x".into()).is_retryable());
        assert!(!GantryError::SignatureInvalid.is_retryable());
        assert!(!GantryError::CircularDependency("a->b".into()).is_retryable());
        assert!(!GantryError::SandboxFailure("exit 1".into()).is_retryable());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(GantryError::SignatureInvalid.kind(), "SignatureInvalid");
        assert_eq!(GantryError::NotFound("s".into()).kind(), "NotFound");
        assert_eq!(GantryError::Cancelled.kind(), "Cancelled");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d1 = backoff_delay(100, 1);
        assert!(d1.as_millis() >= 50 && d1.as_millis() <= 100);
        let d10 = backoff_delay(100, 30);
        assert!(d10.as_millis() <= 60_000);
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let mut calls = 0u32;
        let result: anyhow::Result<()> = retry_with_backoff(5, 1, "test", || {
            calls += 1;
            async { Err(GantryError::SignatureInvalid.into()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_retries_transient_until_success() {
        let mut calls = 0u32;
        let result = retry_with_backoff(5, 1, "test", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(GantryError::Transient("boom".into()).into())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.ok(), Some(3));
    }
}
