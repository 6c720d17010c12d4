use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::thread::{self, ThreadId};

const BUCKETS: usize = 1024;

/// Per-thread "already inside a dispatch" marker
///
/// Threads are spread over a fixed number of buckets by a hash of their id. Each bucket keeps
/// the threads currently inside, behind a lock which is only held to look at the bucket, never
/// while a listener runs.
pub struct SelfCallBarrier {
    buckets: Box<[Mutex<Vec<ThreadId>>]>,
}

impl Default for SelfCallBarrier {
    fn default() -> Self {
        SelfCallBarrier::new()
    }
}

impl SelfCallBarrier {
    pub fn new() -> SelfCallBarrier {
        SelfCallBarrier {
            buckets: (0..BUCKETS).map(|_| Mutex::new(vec![])).collect(),
        }
    }

    fn bucket(&self, thread: ThreadId) -> &Mutex<Vec<ThreadId>> {
        let mut hasher = DefaultHasher::new();
        thread.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % BUCKETS]
    }

    pub fn is_entered(&self, thread: ThreadId) -> bool {
        self.bucket(thread).lock().contains(&thread)
    }

    /// Mark the current thread as inside, unless it already is
    ///
    /// The mark is removed when the guard is dropped.
    pub fn enter(&self) -> Option<BarrierGuard<'_>> {
        let thread = thread::current().id();
        let mut inside = self.bucket(thread).lock();
        if inside.contains(&thread) {
            return None;
        }
        inside.push(thread);
        Some(BarrierGuard {
            barrier: self,
            thread,
        })
    }
}

pub struct BarrierGuard<'a> {
    barrier: &'a SelfCallBarrier,
    thread: ThreadId,
}

impl<'a> Drop for BarrierGuard<'a> {
    fn drop(&mut self) {
        let mut inside = self.barrier.bucket(self.thread).lock();
        if let Some(idx) = inside.iter().position(|thread| *thread == self.thread) {
            inside.swap_remove(idx);
        }
    }
}
