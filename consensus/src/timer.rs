use rand::Rng;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

/// Restartable, randomized election countdown.
///
/// Cloning yields another handle to the same timer. `reset` may be called
/// from any task; `wait` only returns once the current deadline has passed
/// without a reset.
#[derive(Debug, Clone)]
pub struct ElectionTimer {
    inner: Arc<TimerInner>,
}

#[derive(Debug)]
struct TimerInner {
    min_ms: u64,
    max_ms: u64,
    deadline: Mutex<Instant>,
    notify: Notify,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        let max_ms = max_ms.max(min_ms);
        let inner = Arc::new(TimerInner {
            min_ms,
            max_ms,
            deadline: Mutex::new(Instant::now()),
            notify: Notify::new(),
        });
        let timer = Self { inner };
        timer.reset();
        timer
    }

    pub fn interval_range(&self) -> (u64, u64) {
        (self.inner.min_ms, self.inner.max_ms)
    }

    fn random_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.inner.min_ms..=self.inner.max_ms);
        Duration::from_millis(ms)
    }

    /// Pushes the deadline out by a fresh random interval.
    pub fn reset(&self) {
        let deadline = Instant::now() + self.random_timeout();
        *self.lock_deadline() = deadline;
        self.inner.notify.notify_waiters();
    }

    fn deadline(&self) -> Instant {
        *self.lock_deadline()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    /// Sleeps until the deadline passes without being reset.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = self.deadline();
            if Instant::now() >= deadline {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if self.is_expired() {
                        return;
                    }
                }
                _ = &mut notified => {}
            }
        }
    }

    fn lock_deadline(&self) -> std::sync::MutexGuard<'_, Instant> {
        // The guarded value is a plain Instant, so a poisoned lock still
        // holds a usable deadline.
        self.inner
            .deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
