//! Debouncing of in-place mod setting edits.
//!
//! Dragging a slider or typing into a setting field produces a burst of
//! edits. [`ModSettingDebouncer`] keeps only the latest payload and releases
//! it once no further edit has arrived for the configured delay.

use std::time::Duration;

use tokio::time::Instant;

/// Default delay before a settled mod setting edit is sent.
pub const DEFAULT_MOD_SETTINGS_DEBOUNCE: Duration = Duration::from_millis(500);

/// Single-slot, last-write-wins deferred payload.
///
/// # Cancel Safety
///
/// [`fired`](Self::fired) is cancel-safe: the payload is only taken after the
/// deadline has passed, so dropping the future inside `tokio::select!` loses
/// nothing. Re-arming between polls moves the deadline for the next poll.
#[derive(Debug)]
pub struct ModSettingDebouncer<T> {
    delay: Duration,
    pending: Option<(Instant, T)>,
}

impl<T> ModSettingDebouncer<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `payload` after the configured delay.
    ///
    /// Returns `true` if an earlier pending payload was replaced.
    pub fn arm(&mut self, payload: T) -> bool {
        self.arm_after(self.delay, payload)
    }

    /// Schedule `payload` after `delay`, replacing any pending payload.
    pub fn arm_after(&mut self, delay: Duration, payload: T) -> bool {
        self.pending
            .replace((Instant::now() + delay, payload))
            .is_some()
    }

    /// Drop the pending payload. Returns `true` if one was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolve with the pending payload once its deadline passes.
    ///
    /// Never resolves while nothing is armed.
    pub async fn fired(&mut self) -> T {
        let Some(deadline) = self.pending.as_ref().map(|(deadline, _)| *deadline) else {
            return std::future::pending().await;
        };

        tokio::time::sleep_until(deadline).await;

        match self.pending.take() {
            Some((_, payload)) => payload,
            None => std::future::pending().await,
        }
    }
}

impl<T> Default for ModSettingDebouncer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MOD_SETTINGS_DEBOUNCE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let mut debouncer = ModSettingDebouncer::new(Duration::from_millis(500));
        debouncer.arm("settled");

        let start = Instant::now();
        assert_eq!(debouncer.fired().await, "settled");
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(!debouncer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_keeps_only_the_last_payload() {
        let mut debouncer = ModSettingDebouncer::new(Duration::from_millis(500));

        for value in 0..10 {
            let replaced = debouncer.arm(value);
            assert_eq!(replaced, value > 0);
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        assert_eq!(debouncer.fired().await, 9);

        let again = tokio::time::timeout(Duration::from_secs(5), debouncer.fired()).await;
        assert!(again.is_err(), "a second payload must never fire");
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_restarts_the_window() {
        let mut debouncer = ModSettingDebouncer::new(Duration::from_millis(500));
        debouncer.arm(1);
        tokio::time::advance(Duration::from_millis(400)).await;
        debouncer.arm(2);
        tokio::time::advance(Duration::from_millis(400)).await;

        {
            let mut fired = task::spawn(debouncer.fired());
            assert_pending!(fired.poll());
        }
        assert!(debouncer.is_armed());

        tokio::time::advance(Duration::from_millis(100)).await;
        let mut fired = task::spawn(debouncer.fired());
        assert_ready_eq!(fired.poll(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_the_payload() {
        let mut debouncer = ModSettingDebouncer::new(Duration::from_millis(500));
        debouncer.arm(1);
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());

        let fired = tokio::time::timeout(Duration::from_secs(1), debouncer.fired()).await;
        assert!(fired.is_err());
    }

    #[test]
    fn default_delay_is_500ms() {
        let debouncer = ModSettingDebouncer::<()>::default();
        assert_eq!(debouncer.delay(), Duration::from_millis(500));
    }
}
