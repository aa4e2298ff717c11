//! Bounded-retry polling

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of one polling attempt
#[derive(Debug)]
pub enum Progress<T, E> {
    Done(T),
    /// Not there yet; carries the error that explains why, if any
    Pending(Option<E>),
}

#[derive(Debug, Error)]
pub enum WaitError<E> {
    #[error("timed out after {elapsed:?}")]
    Timeout { elapsed: Duration, last: Option<E> },

    #[error("{0}")]
    Aborted(E),
}

/// Call `attempt` every `interval` until it is done, fails, or `timeout`
/// elapses. An attempt still running at the deadline is dropped.
///
/// On timeout the last error an attempt reported as pending is returned
/// alongside the elapsed time.
pub async fn wait_for<T, E, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut attempt: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T, E>, E>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last = None;
    let mut tries: u32 = 0;

    loop {
        tries += 1;
        match tokio::time::timeout_at(deadline, attempt()).await {
            Ok(Ok(Progress::Done(value))) => return Ok(value),
            Ok(Ok(Progress::Pending(reason))) => {
                if reason.is_some() {
                    last = reason;
                }
            }
            Ok(Err(e)) => return Err(WaitError::Aborted(e)),
            Err(_) => break,
        }

        let next = Instant::now() + interval;
        if next >= deadline {
            tokio::time::sleep_until(deadline).await;
            break;
        }
        debug!(attempt = tries, "Not ready, retrying in {:?}", interval);
        tokio::time::sleep_until(next).await;
    }

    Err(WaitError::Timeout {
        elapsed: start.elapsed(),
        last,
    })
}
