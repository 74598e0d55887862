/*!
 * Utility functions and helpers for MotorLink.
 *
 * This module provides the timeout and retry primitives used by the session layer.
 */
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout("Operation timed out")),
    }
}

/// Retry a fallible operation at a fixed interval until it succeeds or is cancelled
///
/// The first attempt runs immediately. Failed attempts are only traced, since
/// the number of attempts is unbounded. Cancellation is observed between
/// attempts: either `cancel` flips to `true` or its sender is dropped.
///
/// # Arguments
///
/// * `interval` - The delay between attempts
/// * `cancel` - A watch receiver that signals cancellation
/// * `future_factory` - A function that creates a new future for each attempt
///
/// # Returns
///
/// `Some` with the first successful result, or `None` if cancelled
pub async fn retry_until_cancelled<F, Fut, T>(
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
    mut future_factory: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u64 = 0;

    loop {
        if *cancel.borrow() {
            debug!("Retry cancelled after {} attempts", attempt);
            return None;
        }

        attempt += 1;
        match future_factory().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("Succeeded after {} attempts", attempt);
                }
                return Some(result);
            }
            Err(e) => {
                trace!("Attempt {} failed: {}", attempt, e);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!("Retry cancelled after {} attempts", attempt);
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let start = Instant::now();

        let result = retry_until_cancelled(Duration::from_millis(20), cancel_rx, move || {
            let current = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if current < 3 {
                    Err(Error::transport("device busy"))
                } else {
                    Ok(current)
                }
            }
        })
        .await;

        assert_eq!(result, Some(3));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        // Three sleeps separate four attempts
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_retry_stops_when_cancelled() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let handle = tokio::spawn(retry_until_cancelled(
            Duration::from_millis(10),
            cancel_rx,
            move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::transport("unplugged")) }
            },
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result, None);

        let attempts = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), attempts);
    }

    #[tokio::test]
    async fn test_retry_stops_when_sender_dropped() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        drop(cancel_tx);

        let result = retry_until_cancelled(Duration::from_millis(10), cancel_rx, || async {
            Err::<(), _>(Error::transport("unplugged"))
        })
        .await;

        assert_eq!(result, None);
    }
}
