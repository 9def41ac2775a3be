//! Watchdog around long-running platform calls.
//!
//! Platform syscalls are synchronous and can stall for minutes when the
//! compute service is wedged. Every call is wrapped here so a stalled call
//! shows up in the log instead of silently hanging a task.

use std::future::Future;
use std::pin::pin;
use std::time::{Duration, Instant};

/// Run `fut` to completion, logging every time `threshold` elapses without
/// the call returning.
pub async fn watched<F, T>(op: &'static str, threshold: Duration, fut: F) -> T
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let mut fut = pin!(fut);
    loop {
        match tokio::time::timeout(threshold, &mut fut).await {
            Ok(value) => return value,
            Err(_) => {
                tracing::warn!(
                    op,
                    elapsed_secs = started.elapsed().as_secs(),
                    "platform call has not returned yet"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_and_returns_the_value() {
        let value = watched("test", Duration::from_secs(10), async { 7 }).await;
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn survives_threshold_crossings() {
        let value = watched("test", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(25)).await;
            "done"
        })
        .await;
        assert_eq!(value, "done");
    }
}
