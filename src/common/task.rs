use std::future::Future;

use tokio::task::JoinHandle;

/// Owns a spawned background task. Stopping or dropping the handle aborts the
/// task at its next suspension point; work the task already handed off to
/// other spawned tasks keeps running.
pub struct TaskHandle {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F>(name: &'static str, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        log::debug!("Starting background task '{}'", name);
        Self {
            name,
            handle: Some(tokio::spawn(fut)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            log::debug!("Stopped background task '{}'", self.name);
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
