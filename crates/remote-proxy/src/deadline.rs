//! One-shot deadline timer.
//!
//! A single "consumed" flag is claimed with a compare-exchange by whichever of
//! cancel or expiry gets there first, so exactly one of the two effects is ever
//! observed. The expiry callback runs on the timer's own task and is expected
//! to do nothing but post into the dispatch context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Armed {
    consumed: Arc<AtomicBool>,
    task: JoinHandle<()>,
    duration: Duration,
}

/// Cancellable one-shot timer.
#[derive(Default)]
pub struct DeadlineTimer {
    armed: Option<Armed>,
}

impl DeadlineTimer {
    /// Create a disarmed timer.
    pub fn new() -> Self {
        Self { armed: None }
    }

    /// Arm the timer, cancelling any previous arm first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&mut self, duration: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();

        let consumed = Arc::new(AtomicBool::new(false));
        let flag = consumed.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if claim(&flag) {
                on_expire();
            }
        });

        self.armed = Some(Armed {
            consumed,
            task,
            duration,
        });
    }

    /// Disarm the timer.
    ///
    /// Returns true if this call won against expiry. Returns false if the
    /// timer already fired (its callback has run or is running), was already
    /// cancelled, or was never armed.
    pub fn cancel(&mut self) -> bool {
        let Some(armed) = self.armed.take() else {
            return false;
        };

        let won = claim(&armed.consumed);
        if won {
            armed.task.abort();
        }
        won
    }

    /// True while armed and neither fired nor cancelled.
    pub fn is_armed(&self) -> bool {
        self.armed
            .as_ref()
            .is_some_and(|armed| !armed.consumed.load(Ordering::Acquire))
    }

    /// Duration of the current arm, if any.
    pub fn duration(&self) -> Option<Duration> {
        self.armed.as_ref().map(|armed| armed.duration)
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}
