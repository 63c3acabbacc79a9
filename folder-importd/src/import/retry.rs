use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use super::backoff::Backoff;
use super::sources::{SourceError, StorageError};

/// Outcome class of one per-file step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl FileError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FileError::Transient(_))
    }
}

impl From<SourceError> for FileError {
    fn from(err: SourceError) -> Self {
        if err.is_transient() {
            FileError::Transient(err.to_string())
        } else {
            FileError::Permanent(err.to_string())
        }
    }
}

impl From<StorageError> for FileError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            FileError::Transient(err.to_string())
        } else {
            FileError::Permanent(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff, timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `op` until it succeeds, fails permanently or the attempts run out.
    /// Each attempt is bounded by the policy timeout, which counts as transient.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, FileError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<FileError>,
    {
        let mut attempt = 1;
        loop {
            let err = match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err.into(),
                Err(_) => {
                    FileError::Transient(format!("{label} timed out after {:?}", self.timeout))
                }
            };
            if !err.is_transient() || attempt >= self.max_attempts {
                return Err(err);
            }
            let delay = self.backoff.delay(attempt - 1);
            warn!(
                step = label,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
