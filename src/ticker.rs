use std::time::Duration;

use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Fixed-cadence timer for a worker loop.
///
/// The first tick completes immediately so a worker does its first pass right
/// after setup.
pub struct Ticker {
    interval: Interval,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        // a slow pass pushes the schedule back instead of bursting
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    /// Waits for the next tick. Returns `false` if the token was cancelled
    /// before or while waiting.
    pub async fn tick(&mut self, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = self.interval.tick() => !token.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_period() {
        let token = CancellationToken::new();
        let mut ticker = Ticker::new(Duration::from_millis(50));
        let start = Instant::now();

        assert!(ticker.tick(&token).await);
        assert!(ticker.tick(&token).await);
        assert!(ticker.tick(&token).await);

        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_sleeping_ticker() {
        let token = CancellationToken::new();
        let mut ticker = Ticker::new(Duration::from_secs(60));
        assert!(ticker.tick(&token).await);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        assert!(!ticker.tick(&token).await);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_cancelled_token_never_ticks() {
        let token = CancellationToken::new();
        token.cancel();
        let mut ticker = Ticker::new(Duration::from_millis(1));
        assert!(!ticker.tick(&token).await);
    }
}
