use std::future::Future;

use crate::protocol::status::StatusResponse;
use crate::providers::{SleepOutcome, ThreadSuspender};

/// Runs `action` up to `max_retries + 1` times with exponential backoff.
///
/// A successful response returns immediately. A 429 also returns
/// immediately: retry-after handling belongs to the calling state, not to
/// the backoff loop. Transport failures (`None`) and other error responses
/// are retried; an interrupted backoff sleep aborts with whatever the last
/// attempt produced.
pub async fn send_with_retry<F, Fut>(
    suspender: &ThreadSuspender,
    action: F,
    max_retries: u32,
    initial_backoff_ms: i64,
) -> Option<StatusResponse>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<StatusResponse>>,
{
    let mut backoff_ms = initial_backoff_ms;
    let mut retries = 0;
    let mut response = action().await;

    loop {
        match &response {
            Some(r) if !r.is_erroneous() => return response,
            Some(r) if r.is_too_many_requests() => return response,
            _ => {}
        }

        if retries >= max_retries {
            return response;
        }

        if suspender.sleep_millis(backoff_ms).await == SleepOutcome::Interrupted {
            return response;
        }

        backoff_ms *= 2;
        retries += 1;
        response = action().await;
    }
}
