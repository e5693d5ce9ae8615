//! Staged retry of fallible async actions.
//!
//! [`retry_action`] re-runs an action while a classifier deems the failure
//! retryable and staged delays remain. The delay list is consumed in order, so
//! `[1s, 3s, 5s]` means at most four attempts.

use std::future::Future;
use std::time::Duration;

use derive_more::Display;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delays used for connection establishment and report delivery.
pub const DEFAULT_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// Decides whether an error is worth another attempt.
pub type Classifier<E> = fn(&E) -> bool;

#[derive(Debug, Display)]
pub enum RetryError<E> {
    /// Cancelled before the first attempt was made.
    #[display("operation cancelled before the first attempt")]
    Cancelled,
    /// The last error observed, returned when it was not retryable, the delays
    /// ran out, or cancellation interrupted a backoff sleep.
    #[display("{_0}")]
    Failed(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Failed(err) => Some(err),
        }
    }
}

/// Run `action`, retrying per `delays` while any of `classifiers` accepts the
/// error. With no classifiers every error is retryable.
pub async fn retry_action<T, E, F, Fut>(
    token: &CancellationToken,
    delays: &[Duration],
    mut action: F,
    classifiers: &[Classifier<E>],
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if token.is_cancelled() {
        return Err(RetryError::Cancelled);
    }

    let mut delays = delays.iter();
    let mut attempt = 1;
    loop {
        let err = match action().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let retryable =
            classifiers.is_empty() || classifiers.iter().any(|is_retryable| is_retryable(&err));
        if !retryable {
            return Err(RetryError::Failed(err));
        }
        let Some(delay) = delays.next() else {
            return Err(RetryError::Failed(err));
        };

        debug!(attempt, delay_ms = delay.as_millis() as u64, "attempt failed, backing off");
        tokio::select! {
            biased;
            () = token.cancelled() => return Err(RetryError::Failed(err)),
            () = tokio::time::sleep(*delay) => {}
        }
        attempt += 1;
    }
}
