//! Bounded concurrent fan-out with per-item results

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{CertError, ItemError, Result};

/// Default cap on concurrent calls to the CA
pub const DEFAULT_FAN_OUT_LIMIT: usize = 10;

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Run `task` for every item, at most `limit` at a time. Results are
/// returned in item order. A panicking task yields an error in its slot.
///
/// When `cancel` fires the wait ends with [`CertError::Canceled`]; tasks
/// already started keep running in the background.
pub async fn fan_out<I, T, F, Fut>(
    items: Vec<I>,
    limit: usize,
    cancel: &CancellationToken,
    task: F,
) -> Result<Vec<Result<T>>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let work = task(item);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (index, AssertUnwindSafe(work).catch_unwind().await)
        });
    }

    let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(total, "Fan-out canceled, leaving tasks to finish");
                set.detach_all();
                return Err(CertError::Canceled);
            }
            joined = set.join_next() => match joined {
                None => break,
                Some(Ok((index, Ok(result)))) => slots[index] = Some(result),
                Some(Ok((index, Err(payload)))) => {
                    let message = panic_message(payload);
                    error!(index, "Fan-out task panicked: {}", message);
                    slots[index] = Some(Err(CertError::Internal(format!("task panicked: {}", message))));
                }
                Some(Err(e)) => error!("Fan-out task failed to join: {}", e),
            },
        }
    }

    Ok(slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(CertError::Internal("task did not complete".into()))))
        .collect())
}

/// Split results into successes and labelled failures
pub fn partition<T>(labels: &[String], results: Vec<Result<T>>) -> (Vec<T>, Vec<ItemError>) {
    let mut ok = Vec::new();
    let mut failures = Vec::new();
    for (label, result) in labels.iter().zip(results) {
        match result {
            Ok(value) => ok.push(value),
            Err(error) => failures.push(ItemError {
                item: label.clone(),
                error,
            }),
        }
    }
    (ok, failures)
}
