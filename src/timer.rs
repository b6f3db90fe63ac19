use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Cancellable one-shot delay. Dropping an armed timer cancels it.
#[derive(Debug, Default)]
pub struct DebounceTimer {
    handle: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Runs `task` after `delay`. Must be called inside a tokio runtime.
    pub fn start<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn restart<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        *self = Self::start(delay, task);
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forgets the handle without aborting, for use from inside the timer's
    /// own task.
    pub fn disarm(&mut self) {
        self.handle.take();
    }

    pub fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
