use std::sync::atomic::{AtomicUsize, Ordering};

use crate::reactor::{IoHandle, IoThread};

/// Pool of transfer threads. Each connection is assigned one thread
/// round-robin at creation and stays on it, so all I/O for a connection is
/// naturally serialized.
pub(crate) struct TransferPool {
    threads: Vec<IoThread>,
    next: AtomicUsize,
}

impl TransferPool {
    pub fn spawn(thread_count: u32) -> Self {
        let thread_count = thread_count.max(1) as usize;
        let threads = (0..thread_count)
            .map(|i| IoThread::spawn(&format!("hawser-transfer-{i}")))
            .collect();
        Self { threads, next: AtomicUsize::new(0) }
    }

    pub fn assign(&self) -> IoHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[index].handle()
    }

    pub fn stop(&self) {
        for thread in &self.threads {
            thread.stop();
        }
    }
}
