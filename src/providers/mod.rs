use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Wall-clock time source, injected so tests can supply deterministic fakes.
pub trait TimingProvider: Send + Sync {
    /// Current timestamp in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// System clock backed by `SystemTime`.
#[derive(Debug, Default)]
pub struct SystemTimingProvider;

impl TimingProvider for SystemTimingProvider {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as i64
    }
}

/// Pseudo-random number source used for anonymized device identifiers.
pub trait PrnGenerator: Send + Sync {
    /// Returns a non-negative pseudo-random number below `bound`.
    fn next_i64(&self, bound: i64) -> i64;
}

/// Default PRNG backed by the thread-local `rand` generator.
#[derive(Debug, Default)]
pub struct DefaultPrnGenerator;

impl PrnGenerator for DefaultPrnGenerator {
    fn next_i64(&self, bound: i64) -> i64 {
        rand::thread_rng().gen_range(0..bound.max(1))
    }
}

/// Provides the identifier of the calling thread for wire records.
pub trait ThreadIdProvider: Send + Sync {
    /// Returns a positive integer identifying the calling thread.
    fn thread_id(&self) -> i32;
}

/// Default provider hashing the OS thread id down to a positive `i32`.
#[derive(Debug, Default)]
pub struct DefaultThreadIdProvider;

impl ThreadIdProvider for DefaultThreadIdProvider {
    fn thread_id(&self) -> i32 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let hash = hasher.finish();
        // Fold to a positive i32 so the wire value is stable and printable.
        (((hash >> 32) ^ hash) as i32) & i32::MAX
    }
}

/// Outcome of an interruptible sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The full duration elapsed.
    Slept,
    /// Shutdown was requested before the duration elapsed.
    Interrupted,
}

/// Interruptible sleep primitive for the sender task.
///
/// Wraps the shared shutdown token so that any in-progress wait returns
/// early once shutdown is requested. Callers receive the outcome and must
/// not continue network work after an interruption.
#[derive(Clone)]
pub struct ThreadSuspender {
    cancel: CancellationToken,
}

impl ThreadSuspender {
    /// Creates a suspender observing the given shutdown token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Returns true once shutdown has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleeps for the given duration, waking early on shutdown.
    pub async fn sleep(&self, duration: Duration) -> SleepOutcome {
        if self.cancel.is_cancelled() {
            return SleepOutcome::Interrupted;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => SleepOutcome::Interrupted,
            _ = tokio::time::sleep(duration) => SleepOutcome::Slept,
        }
    }

    /// Sleeps for `millis` milliseconds; non-positive values return immediately.
    pub async fn sleep_millis(&self, millis: i64) -> SleepOutcome {
        if millis <= 0 {
            if self.cancel.is_cancelled() {
                return SleepOutcome::Interrupted;
            }
            return SleepOutcome::Slept;
        }
        self.sleep(Duration::from_millis(millis as u64)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_timing_is_monotonic_enough() {
        let timing = SystemTimingProvider;
        let a = timing.now_millis();
        let b = timing.now_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // after Sep 2020
    }

    #[test]
    fn test_prng_respects_bound() {
        let prng = DefaultPrnGenerator;
        for _ in 0..100 {
            let v = prng.next_i64(1000);
            assert!((0..1000).contains(&v));
        }
    }

    #[test]
    fn test_thread_id_is_positive_and_stable() {
        let provider = DefaultThreadIdProvider;
        let first = provider.thread_id();
        let second = provider.thread_id();
        assert!(first >= 0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_thread_id_differs_across_threads() {
        let provider = DefaultThreadIdProvider;
        let main_id = provider.thread_id();
        let other_id = std::thread::spawn(|| DefaultThreadIdProvider.thread_id())
            .join()
            .expect("thread join");
        assert_ne!(main_id, other_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_naturally() {
        let suspender = ThreadSuspender::new(CancellationToken::new());
        let outcome = suspender.sleep(Duration::from_secs(5)).await;
        assert_eq!(outcome, SleepOutcome::Slept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancellation() {
        let cancel = CancellationToken::new();
        let suspender = ThreadSuspender::new(cancel.clone());

        let waiter = tokio::spawn(async move { suspender.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        cancel.cancel();

        let outcome = waiter.await.expect("task join");
        assert_eq!(outcome, SleepOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_sleep_millis_non_positive_returns_immediately() {
        let suspender = ThreadSuspender::new(CancellationToken::new());
        assert_eq!(suspender.sleep_millis(0).await, SleepOutcome::Slept);
        assert_eq!(suspender.sleep_millis(-5).await, SleepOutcome::Slept);
    }

    #[tokio::test]
    async fn test_sleep_after_cancellation_returns_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let suspender = ThreadSuspender::new(cancel);
        assert_eq!(
            suspender.sleep(Duration::from_secs(1)).await,
            SleepOutcome::Interrupted
        );
        assert_eq!(suspender.sleep_millis(0).await, SleepOutcome::Interrupted);
    }
}
