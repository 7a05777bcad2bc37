//! Shared fixtures for leaseq integration tests.

use leaseq_runtime::{Clock, FileQueue, ManualClock, QueueName, SequentialHandleGenerator};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A temporary log directory and a clock every instance shares
pub struct SharedLog {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
}

impl SharedLog {
    pub fn new(start_ms: i64) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            clock: Arc::new(ManualClock::new(start_ms)),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A fresh instance over the same log, as another process would open it
    #[allow(dead_code)]
    pub fn instance(&self) -> FileQueue {
        FileQueue::open(self.dir.path(), self.clock()).unwrap()
    }

    /// An instance whose generated handles are `<prefix>-1`, `<prefix>-2`, ...
    #[allow(dead_code)]
    pub fn instance_with_handles(&self, prefix: &str) -> FileQueue {
        FileQueue::open_with(
            self.dir.path(),
            "QUEUE",
            self.clock(),
            Arc::new(SequentialHandleGenerator::new(prefix)),
        )
        .unwrap()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    #[allow(dead_code)]
    pub fn log_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("QUEUE"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[allow(dead_code)]
pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}
