//! Trailing-edge debouncing for bursty inputs such as filter keystrokes.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type Action<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct Pending {
    generation: u64,
    timer: Option<JoinHandle<()>>,
    /// Actions that have started and may still be running
    running: Vec<JoinHandle<()>>,
}

impl Pending {
    fn abort_all(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        for action in self.running.drain(..) {
            action.abort();
        }
    }
}

/// Delays an action until calls stop arriving for `delay`.
///
/// Every [`Debouncer::call`] cancels the pending timer and starts a new one,
/// so only the last value of a burst reaches the action. Once the action has
/// started it runs as its own task; later calls and [`Debouncer::cancel`]
/// leave it alone, [`Debouncer::shutdown`] and drop abort it.
pub struct Debouncer<T> {
    delay: Duration,
    action: Action<T>,
    pending: Arc<Mutex<Pending>>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new<F, Fut>(delay: Duration, action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            delay,
            action: Arc::new(move |value: T| -> BoxFuture<'static, ()> { Box::pin(action(value)) }),
            pending: Arc::new(Mutex::new(Pending {
                generation: 0,
                timer: None,
                running: Vec::new(),
            })),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedules `value`, replacing any value still waiting.
    pub fn call(&self, value: T) {
        let mut pending = self.pending.lock();
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.generation += 1;
        let generation = pending.generation;

        let delay = self.delay;
        let action = self.action.clone();
        let shared = Arc::clone(&self.pending);
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut pending = shared.lock();
            if pending.generation != generation {
                return;
            }
            pending.timer = None;
            pending.running.retain(|handle| !handle.is_finished());
            pending.running.push(tokio::spawn(action(value)));
        }));
    }

    /// Drops the waiting value, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock();
        pending.generation += 1;
        match pending.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().timer.is_some()
    }

    /// Drops the waiting value and aborts actions that are still running.
    pub fn shutdown(&self) {
        let mut pending = self.pending.lock();
        pending.generation += 1;
        pending.abort_all();
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.pending.lock().abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Debouncer<String>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let debouncer = Debouncer::new(Duration::from_millis(300), move |value: String| {
            let sink = sink.clone();
            async move {
                sink.lock().push(value);
            }
        });
        (seen, debouncer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_last_value() {
        let (seen, debouncer) = recorder();
        for query in ["a", "ab", "abc", "abcd", "abcde"] {
            debouncer.call(query.to_string());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(debouncer.is_pending());
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*seen.lock(), vec!["abcde".to_string()]);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_each_fire() {
        let (seen, debouncer) = recorder();
        debouncer.call("first".to_string());
        tokio::time::sleep(Duration::from_millis(400)).await;
        debouncer.call("second".to_string());
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(*seen.lock(), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending_value() {
        let (seen, debouncer) = recorder();
        debouncer.call("typed".to_string());
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_running_action() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let debouncer = Debouncer::new(Duration::from_millis(300), move |value: String| {
            let sink = sink.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                sink.lock().push(value);
            }
        });

        debouncer.call("slow".to_string());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!debouncer.is_pending());
        assert!(!debouncer.cancel());

        debouncer.shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_running_action() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let debouncer = Debouncer::new(Duration::from_millis(300), move |value: String| {
            let sink = sink.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                sink.lock().push(value);
            }
        });

        debouncer.call("slow".to_string());
        tokio::time::sleep(Duration::from_millis(350)).await;
        debouncer.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*seen.lock(), vec!["slow".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_timer() {
        let (seen, debouncer) = recorder();
        debouncer.call("late".to_string());
        drop(debouncer);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(seen.lock().is_empty());
    }
}
