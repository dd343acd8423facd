//! Cancelable sleep used by every timed loop.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleeps for `duration` unless `token` is cancelled first.
///
/// Returns `true` when the full duration elapsed, `false` on cancellation.
/// Cancellation wins when both are ready.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => !token.is_cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let start = tokio::time::Instant::now();
        assert!(sleep_or_cancel(Duration::from_secs(2), &token).await);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_early_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let start = tokio::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(30), &token).await);
        assert!(start.elapsed() < Duration::from_secs(30));
    }
}
