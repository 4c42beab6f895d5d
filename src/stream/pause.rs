use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

/// Shortest sleep while paused.
const MIN_PAUSE_SLEEP: Duration = Duration::from_millis(50);
/// Longest sleep while paused, so a cleared pause is noticed quickly.
const MAX_PAUSE_SLEEP: Duration = Duration::from_millis(250);

/// Shared "pause the reader until T" flag.
///
/// Exclusive device operations arm it to keep the reader off the link.
#[derive(Debug, Default)]
pub struct PauseGate {
    until: parking_lot::Mutex<Option<Instant>>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause for at least `duration`. Never shortens an existing pause.
    pub fn pause_for(&self, duration: Duration, reason: &str) {
        let target = Instant::now() + duration;
        let mut until = self.until.lock();
        if until.map_or(true, |current| target > current) {
            *until = Some(target);
            info!(
                pause_ms = duration.as_millis() as u64,
                reason, "stream reader paused"
            );
        }
    }

    /// Lift any pause immediately.
    pub fn resume(&self) {
        *self.until.lock() = None;
    }

    /// Time left in the current pause, zero when not paused.
    pub fn remaining(&self) -> Duration {
        let until = *self.until.lock();
        until
            .map(|t| t.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_paused(&self) -> bool {
        !self.remaining().is_zero()
    }

    /// How long the reader should sleep before re-checking, if paused.
    pub fn sleep_hint(&self) -> Option<Duration> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return None;
        }
        Some(remaining.clamp(MIN_PAUSE_SLEEP, MAX_PAUSE_SLEEP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_expire() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());
        assert_eq!(gate.sleep_hint(), None);

        gate.pause_for(Duration::from_secs(2), "test");
        assert!(gate.is_paused());
        assert_eq!(gate.sleep_hint(), Some(MAX_PAUSE_SLEEP));

        tokio::time::advance(Duration::from_millis(1990)).await;
        assert_eq!(gate.sleep_hint(), Some(MIN_PAUSE_SLEEP));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(!gate.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_never_shortens() {
        let gate = PauseGate::new();
        gate.pause_for(Duration::from_secs(6), "long");
        gate.pause_for(Duration::from_secs(1), "short");
        assert!(gate.remaining() > Duration::from_secs(5));

        gate.pause_for(Duration::from_secs(10), "longer");
        assert!(gate.remaining() > Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_clears_pause() {
        let gate = PauseGate::new();
        gate.pause_for(Duration::from_secs(5), "test");
        gate.resume();
        assert!(!gate.is_paused());
    }
}
