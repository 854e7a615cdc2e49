/// Per-queue timeout accounting.
///
/// In-flight read/write commands are stamped with the controller's current
/// `timeout_id` and counted into that bucket; completion decrements it. The
/// host's coarse (~1 s) timer advances the id. A bucket that still holds
/// commands when the id is about to wrap back onto it has been waiting a
/// full revolution — those commands are stuck and the controller resets.
use core::sync::atomic::{AtomicU32, Ordering};

/// Bucket count; at a one-second tick this bounds detection latency to
/// roughly `TIMEOUT_BUCKETS` seconds.
pub const TIMEOUT_BUCKETS: usize = 40;

pub struct TimeoutTable {
    buckets: [AtomicU32; TIMEOUT_BUCKETS],
}

impl TimeoutTable {
    pub fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }

    pub fn note_submit(&self, timeout_id: u32) {
        self.buckets[timeout_id as usize % TIMEOUT_BUCKETS].fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_complete(&self, timeout_id: u32) {
        let prev =
            self.buckets[timeout_id as usize % TIMEOUT_BUCKETS].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev != 0, "timeout bucket underflow");
    }

    pub fn pending(&self, timeout_id: u32) -> u32 {
        self.buckets[timeout_id as usize % TIMEOUT_BUCKETS].load(Ordering::Relaxed)
    }

    /// True when commands stamped a full bucket revolution ago are still
    /// outstanding. `next_id` is the id the tick is about to install.
    pub fn stuck(&self, next_id: u32) -> bool {
        self.pending(next_id) > 0
    }
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_complete_balance() {
        let t = TimeoutTable::new();
        t.note_submit(3);
        t.note_submit(3);
        t.note_complete(3);
        assert_eq!(t.pending(3), 1);
        t.note_complete(3);
        assert_eq!(t.pending(3), 0);
    }

    #[test]
    fn stuck_after_full_revolution() {
        let t = TimeoutTable::new();
        t.note_submit(5);
        // The tick wrapping back onto bucket 5 sees it still occupied.
        assert!(t.stuck(5));
        t.note_complete(5);
        assert!(!t.stuck(5));
    }

    #[test]
    fn ids_wrap_modulo_bucket_count() {
        let t = TimeoutTable::new();
        t.note_submit(TIMEOUT_BUCKETS as u32 + 2);
        assert_eq!(t.pending(2), 1);
    }
}
