//! Fixed-rate pacing and cooperative stop signals for worker loops.
//!
//! Every periodic worker (acquisition, consumers, trigger verification) waits
//! `period - last_processing_time` between passes, so a slow pass shortens the
//! next pause instead of drifting the rate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Cooperative stop request shared by a worker and its owner.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Not yet triggered.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask every holder to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Clear a previous request so the signal can be reused.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// A stop was requested.
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop was requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Pacer for one worker loop.
#[derive(Debug)]
pub struct PacedPoll {
    period: Duration,
    started: Option<Instant>,
    last_processing: Duration,
}

impl PacedPoll {
    /// Pacer targeting one pass per `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            started: None,
            last_processing: Duration::ZERO,
        }
    }

    /// Pacer running at `hz` passes per second.
    pub fn from_hz(hz: f64) -> Self {
        Self::new(crate::config::period_of(hz))
    }

    /// Target period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Takes effect on the next pause.
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Processing time measured by the last [`finish`](Self::finish).
    pub fn last_processing(&self) -> Duration {
        self.last_processing
    }

    /// Pause before the next pass. Returns `false` when `stop` fired.
    pub async fn wait(&mut self, stop: &StopSignal) -> bool {
        let pause = self.period.saturating_sub(self.last_processing);
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = stop.cancelled() => return false,
        }
        self.started = Some(Instant::now());
        !stop.is_set()
    }

    /// Mark the end of a pass.
    pub fn finish(&mut self) -> Duration {
        self.last_processing = self
            .started
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed());
        self.last_processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slow_pass_shortens_next_pause() {
        let stop = StopSignal::new();
        let mut pacer = PacedPoll::new(Duration::from_millis(100));

        let t0 = Instant::now();
        assert!(pacer.wait(&stop).await);
        assert_eq!(t0.elapsed(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pacer.finish(), Duration::from_millis(30));

        let t1 = Instant::now();
        assert!(pacer.wait(&stop).await);
        assert_eq!(t1.elapsed(), Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlong_pass_does_not_sleep() {
        let stop = StopSignal::new();
        let mut pacer = PacedPoll::new(Duration::from_millis(50));
        assert!(pacer.wait(&stop).await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        pacer.finish();

        let t = Instant::now();
        assert!(pacer.wait(&stop).await);
        assert_eq!(t.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_stop_interrupts_wait() {
        let stop = StopSignal::new();
        let mut pacer = PacedPoll::new(Duration::from_secs(3600));
        let remote = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.trigger();
        });
        assert!(!pacer.wait(&stop).await);
        assert!(stop.is_set());
        stop.reset();
        assert!(!stop.is_set());
    }
}
