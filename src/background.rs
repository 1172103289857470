use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// Tracks work spawned outside the request/response cycle so shutdown can
/// wait for it. A panicking task is logged and does not take anything else down.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                error!(task = name, panic = %panic_message(panic.as_ref()), "background task panicked");
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Stops accepting new work and waits for everything already spawned.
    pub async fn close_and_wait(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(pending = self.tracker.len(), "waiting for background tasks to finish");
        }
        self.tracker.wait().await;
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn waits_for_spawned_work() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            tasks.spawn("count", async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.close_and_wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        tasks.spawn("boom", async { panic!("mail server exploded") });
        let counter = done.clone();
        tasks.spawn("after", async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tasks.close_and_wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
