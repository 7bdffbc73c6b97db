//! Jittered delays and sleeps that end early on cancellation.

use rand_distr::{Distribution, Normal};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lower clamp applied to every jittered delay.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Gaussian jitter around `base` with a standard deviation of 30% of `base`,
/// clamped below at [`MIN_DELAY`].
pub fn jittered(base: Duration) -> Duration {
    let mean = base.as_secs_f64();
    let secs = Normal::new(mean, mean * 0.3)
        .map(|normal| normal.sample(&mut rand::thread_rng()))
        .unwrap_or(mean);
    Duration::from_secs_f64(secs.max(MIN_DELAY.as_secs_f64()))
}

/// Sleeps for `delay` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// [`sleep_or_cancel`] over a [`jittered`] delay.
pub async fn jittered_sleep(base: Duration, cancel: &CancellationToken) -> bool {
    sleep_or_cancel(jittered(base), cancel).await
}
