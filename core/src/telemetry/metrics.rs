use serde::{Deserialize, Serialize};

/// Counters describing the work a task has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Frames (or folds) transformed.
    pub frames: u64,
    /// Samples pulled from the parent stream.
    pub parent_samples: u64,
    /// Samples handed to callers.
    pub output_samples: u64,
    pub seeks: u64,
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    inner: MetricsSnapshot,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frames(&mut self, frames: usize) {
        self.inner.frames += frames as u64;
    }

    pub fn record_parent_samples(&mut self, samples: usize) {
        self.inner.parent_samples += samples as u64;
    }

    pub fn record_output(&mut self, samples: usize) {
        self.inner.output_samples += samples as u64;
    }

    pub fn record_seek(&mut self) {
        self.inner.seeks += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
    }
}
