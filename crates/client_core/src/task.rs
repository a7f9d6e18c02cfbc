use tokio::task::JoinHandle;

/// Background task owned by the engine; aborted when dropped.
#[derive(Debug)]
pub(crate) struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub(crate) fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            tracing::debug!(task = self.name, "engine: cancelling scheduled task");
            self.handle.abort();
        }
    }
}
