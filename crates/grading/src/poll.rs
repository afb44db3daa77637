//! Bounded polling with an injectable clock.

use crate::context::CancelToken;
use std::thread;
use std::time::{Duration, Instant};

/// Time source for polling loops.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The probe succeeded after this many attempts
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
    Cancelled,
}

/// Callback for poll progress notifications.
pub trait PollCallback {
    /// Called after each failed attempt.
    fn on_attempt(&self, attempt: u32, elapsed: Duration);
}

/// Callback that logs each failed attempt at debug level.
pub struct LogCallback<'a>(pub &'a str);

impl PollCallback for LogCallback<'_> {
    fn on_attempt(&self, attempt: u32, elapsed: Duration) {
        log::debug!("{}: attempt {attempt} failed ({}s elapsed)", self.0, elapsed.as_secs());
    }
}

/// Call `probe` every `interval` until it returns true or `timeout` passes.
///
/// The probe always runs at least once. The last sleep is shortened so the
/// loop never overshoots the deadline by more than one probe.
pub fn poll_until<F>(
    clock: &dyn Clock,
    timeout: Duration,
    interval: Duration,
    cancel: &CancelToken,
    callback: Option<&dyn PollCallback>,
    mut probe: F,
) -> PollOutcome
where
    F: FnMut() -> bool,
{
    let start = clock.now();
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        attempts += 1;
        if probe() {
            return PollOutcome::Ready { attempts };
        }

        let elapsed = clock.now().saturating_duration_since(start);
        if let Some(cb) = callback {
            cb.on_attempt(attempts, elapsed);
        }
        if elapsed >= timeout {
            return PollOutcome::TimedOut { attempts };
        }
        clock.sleep(interval.min(timeout - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeClock;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_ready_on_third_attempt() {
        let clock = FakeClock::new();
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();

        let outcome = poll_until(
            &clock,
            Duration::from_secs(60),
            Duration::from_secs(5),
            &CancelToken::new(),
            None,
            || {
                calls_clone.set(calls_clone.get() + 1);
                calls_clone.get() == 3
            },
        );

        assert_eq!(outcome, PollOutcome::Ready { attempts: 3 });
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_times_out_at_deadline() {
        let clock = FakeClock::new();
        let outcome = poll_until(
            &clock,
            Duration::from_secs(12),
            Duration::from_secs(5),
            &CancelToken::new(),
            None,
            || false,
        );

        // probes at 0, 5, 10 and 12
        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 4 });
        assert_eq!(clock.elapsed(), Duration::from_secs(12));
    }

    #[test]
    fn test_zero_timeout_probes_once() {
        let clock = FakeClock::new();
        let outcome = poll_until(
            &clock,
            Duration::ZERO,
            Duration::from_secs(5),
            &CancelToken::new(),
            None,
            || false,
        );
        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 1 });
    }

    #[test]
    fn test_cancelled_before_probe() {
        let clock = FakeClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = poll_until(
            &clock,
            Duration::from_secs(60),
            Duration::from_secs(1),
            &cancel,
            None,
            || true,
        );
        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[test]
    fn test_callback_invoked_per_failed_attempt() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingCallback(Arc<AtomicU32>);
        impl PollCallback for CountingCallback {
            fn on_attempt(&self, _: u32, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let callback = CountingCallback(count.clone());
        let clock = FakeClock::new();
        let attempts = Cell::new(0);

        poll_until(
            &clock,
            Duration::from_secs(60),
            Duration::from_secs(1),
            &CancelToken::new(),
            Some(&callback),
            || {
                attempts.set(attempts.get() + 1);
                attempts.get() == 4
            },
        );

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
