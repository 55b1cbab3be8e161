//! Repeating background task with explicit start, stop and tick observation.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A closure run on a fixed interval until stopped.
///
/// Every completed tick bumps a counter that can be awaited with
/// [`next_tick`](Self::next_tick), which lets tests step the loop
/// deterministically instead of sleeping.
pub struct RepeatingTask {
    name: String,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    ticks: watch::Receiver<u64>,
}

impl RepeatingTask {
    /// Spawn the task on the current tokio runtime. The first tick fires immediately.
    pub fn start<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(0u64);

        let token = cancel.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tick().await;
                tx.send_modify(|count| *count += 1);
            }

            tracing::debug!("Repeating task '{}' exited", task_name);
        });

        tracing::debug!("Repeating task '{}' started (every {:?})", name, interval);

        Self {
            name,
            cancel,
            handle: Mutex::new(Some(handle)),
            ticks: rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        *self.ticks.borrow()
    }

    /// Wait for the next tick to complete and return the new tick count.
    ///
    /// Returns immediately with the final count if the task has stopped.
    pub async fn next_tick(&self) -> u64 {
        let mut rx = self.ticks.clone();
        rx.borrow_and_update();
        let _ = rx.changed().await;
        let count = *rx.borrow();
        count
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Cancel the task and wait for its current tick to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Repeating task '{}' ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticks_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let task = RepeatingTask::start("counter", Duration::from_millis(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.next_tick().await;
        task.next_tick().await;
        assert!(task.tick_count() >= 2);
        assert!(task.is_running());

        task.stop().await;
        assert!(!task.is_running());

        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_next_tick_after_stop_returns() {
        let task = RepeatingTask::start("idle", Duration::from_millis(5), || async {});
        task.stop().await;

        let count = task.next_tick().await;
        assert_eq!(count, task.tick_count());
    }
}
