//! Eventually-consistent assertion support.
//!
//! [`Retry::assert`] runs a block repeatedly until it stops failing or the
//! strategy gives up. Each attempt runs against a buffered recording
//! reporter, so the evidence of a transient failure is thrown away; only the
//! final attempt's events reach the real reporter. Cleanups registered by a
//! failing attempt run before the next attempt starts, so retried blocks can
//! allocate per-attempt resources safely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::recorder::RecordingReporter;
use crate::reporter::Reporter;
use crate::sandbox::{self, Outcome};

/// Decides how many times a failing block is retried.
///
/// `attempt` runs the block once and returns `true` while it is still
/// failing. Implementations keep calling it until it returns `false` or
/// their budget runs out; they never call it again after a `false`.
pub trait RetryStrategy: Send + Sync {
    fn while_failing(&self, attempt: &mut dyn FnMut() -> bool);
}

/// Allows `n` retries after the first attempt (`n + 1` runs in total).
pub struct Count(pub usize);

impl RetryStrategy for Count {
    fn while_failing(&self, attempt: &mut dyn FnMut() -> bool) {
        for _ in 0..=self.0 {
            if !attempt() {
                return;
            }
        }
    }
}

/// Retries until the deadline passes. The first attempt always runs; the
/// clock is only consulted between attempts.
pub struct Timeout(pub Duration);

impl RetryStrategy for Timeout {
    fn while_failing(&self, attempt: &mut dyn FnMut() -> bool) {
        let deadline = Instant::now() + self.0;
        let waiter = Waiter::default();
        loop {
            if !attempt() {
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            waiter.wait();
        }
    }
}

/// The pause between timed retry attempts.
pub struct Waiter {
    pub wait_duration: Duration,
}

impl Default for Waiter {
    fn default() -> Self {
        Waiter {
            wait_duration: Duration::from_millis(1),
        }
    }
}

impl Waiter {
    pub fn wait(&self) {
        std::thread::yield_now();
        std::thread::sleep(self.wait_duration);
    }
}

/// Any closure driving the attempt loop is a strategy.
impl<F> RetryStrategy for F
where
    F: Fn(&mut dyn FnMut() -> bool) + Send + Sync,
{
    fn while_failing(&self, attempt: &mut dyn FnMut() -> bool) {
        self(attempt)
    }
}

/// An assertion helper that re-runs its block under a [`RetryStrategy`].
pub struct Retry {
    strategy: Arc<dyn RetryStrategy>,
}

/// Shorthand for `Retry::new(strategy)`.
pub fn eventually(strategy: impl RetryStrategy + 'static) -> Retry {
    Retry::new(strategy)
}

impl Retry {
    pub fn new(strategy: impl RetryStrategy + 'static) -> Self {
        Retry {
            strategy: Arc::new(strategy),
        }
    }

    pub(crate) fn from_arc(strategy: Arc<dyn RetryStrategy>) -> Self {
        Retry { strategy }
    }

    /// Runs `block` until it stops failing or the strategy gives up.
    ///
    /// Every attempt gets a fresh buffered recorder over `reporter`. A
    /// failing attempt's cleanups run before the next attempt starts. After
    /// the loop the last attempt's record is replayed to `reporter`, so a
    /// final failure carries its full evidence and a success carries its
    /// logs and cleanups. When `reporter` is already failed the loop stops
    /// without another attempt.
    pub fn assert(&self, reporter: &Arc<dyn Reporter>, block: impl Fn(Arc<dyn Reporter>)) {
        let mut last: Option<RecordingReporter> = None;
        let mut attempt_no = 0usize;

        let mut attempt = || -> bool {
            if reporter.failed() {
                return false;
            }
            if let Some(prev) = last.take() {
                prev.cleanup_now();
            }
            attempt_no += 1;

            let rec = RecordingReporter::buffered(Arc::clone(reporter));
            let outcome = sandbox::run(|| block(rec.as_reporter()));
            if let Outcome::Panicked(payload) = outcome {
                rec.error(&sandbox::panic_message(&payload));
            }

            let failing = rec.failed();
            if failing {
                log::debug!("retry attempt {attempt_no} still failing");
            }
            last = Some(rec);
            failing
        };
        self.strategy.while_failing(&mut attempt);

        if let Some(rec) = last {
            rec.replay();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn succeeds_once_the_block_stops_failing() {
        let attempts = AtomicUsize::new(0);
        let null = NullReporter::new();
        let outer = null.as_reporter();

        eventually(Count(5)).assert(&outer, |r| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                r.error("not yet");
            }
        });

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!null.failed());
    }

    #[test]
    fn exhausting_the_budget_surfaces_the_last_failure() {
        let null = NullReporter::new();
        let outer = null.as_reporter();

        eventually(Count(2)).assert(&outer, |r| r.error("always broken"));

        assert!(null.failed());
        // only the last attempt's evidence is replayed
        assert_eq!(null.messages(), vec!["always broken".to_string()]);
    }

    #[test]
    fn failing_attempt_cleanups_run_before_the_next_attempt() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let attempts = AtomicUsize::new(0);
        let null = NullReporter::new();
        let outer = null.as_reporter();

        eventually(Count(5)).assert(&outer, |r| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            assert_eq!(
                cleanups.load(Ordering::SeqCst),
                n,
                "every earlier attempt's cleanup must have run already"
            );
            let cleanups = Arc::clone(&cleanups);
            r.cleanup(Box::new(move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            }));
            if n < 2 {
                r.error("not yet");
            }
        });

        assert!(!null.failed());
        // the successful attempt's cleanup is replayed to the outer reporter
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_panicking_attempt_counts_as_failing() {
        let attempts = AtomicUsize::new(0);
        let null = NullReporter::new();
        let outer = null.as_reporter();

        eventually(Count(3)).assert(&outer, |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("flaky panic");
            }
        });

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!null.failed());
    }

    #[test]
    fn an_already_failed_reporter_stops_the_loop() {
        let attempts = AtomicUsize::new(0);
        let null = NullReporter::new();
        null.fail();
        let outer = null.as_reporter();

        eventually(Count(100)).assert(&outer, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timeout_runs_at_least_one_attempt() {
        let attempts = AtomicUsize::new(0);
        let null = NullReporter::new();
        let outer = null.as_reporter();

        eventually(Timeout(Duration::ZERO)).assert(&outer, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_keeps_retrying_until_the_deadline() {
        let attempts = AtomicUsize::new(0);
        let null = NullReporter::new();
        let outer = null.as_reporter();

        eventually(Timeout(Duration::from_secs(5))).assert(&outer, |r| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                r.error("not yet");
            }
        });

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(!null.failed());
    }

    #[test]
    fn a_closure_is_a_strategy() {
        let attempts = AtomicUsize::new(0);
        let null = NullReporter::new();
        let outer = null.as_reporter();

        // exactly two runs, failing or not
        let twice = |attempt: &mut dyn FnMut() -> bool| {
            for _ in 0..2 {
                if !attempt() {
                    return;
                }
            }
        };
        eventually(twice).assert(&outer, |r| {
            attempts.fetch_add(1, Ordering::SeqCst);
            r.error("never passes");
        });

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(null.failed());
    }
}
