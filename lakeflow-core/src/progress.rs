//! Progress counters shared between a running subtask and its workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cloneable `current / total` counter.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    current: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, n: usize) {
        self.current.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_total(&self, n: usize) {
        self.total.store(n, Ordering::Relaxed);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.current.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
    }
}
