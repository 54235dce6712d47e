use ::log::{debug, info, trace};
use std::fmt;

/// Log sink that tags every record with the task that produced it.
#[derive(Debug, Clone, Copy)]
pub struct LogManager {
    task: &'static str,
}

impl LogManager {
    pub fn new(task: &'static str) -> Self {
        Self { task }
    }

    pub fn task(&self) -> &'static str {
        self.task
    }

    /// Construction and configuration details.
    pub fn record(&self, message: fmt::Arguments<'_>) {
        debug!("[{}] {}", self.task, message);
    }

    /// Policy decisions a user should see, such as trimmed edges.
    pub fn notice(&self, message: fmt::Arguments<'_>) {
        info!("[{}] {}", self.task, message);
    }

    /// Per-batch work.
    pub fn detail(&self, message: fmt::Arguments<'_>) {
        trace!("[{}] {}", self.task, message);
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new("stream")
    }
}
