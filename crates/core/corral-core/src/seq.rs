//! Sequence counter for torn-read detection.
//!
//! A single writer bumps the counter odd before mutating a shared
//! structure and even after. Readers snapshot the counter, read, and
//! retry if the counter was odd or moved. Used for the vcore/pcore maps,
//! which the kernel updates while user code walks them locklessly.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::atomic::cpu_relax;

/// A seqlock-style generation counter. Odd while a write is in flight.
#[derive(Default)]
pub struct SeqCounter(AtomicU32);

impl SeqCounter {
    /// Creates a counter at generation zero (no write in flight).
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Marks the start of a write section. The counter becomes odd.
    ///
    /// Writers must be externally serialized; this only publishes the
    /// in-flight state to readers.
    pub fn write_begin(&self) {
        let prev = self.0.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev % 2 == 0, "nested or unserialized seq write");
    }

    /// Marks the end of a write section. The counter becomes even.
    pub fn write_end(&self) {
        let prev = self.0.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev % 2 == 1, "write_end without write_begin");
    }

    /// Snapshots the counter for a read section, spinning past any
    /// in-flight write.
    pub fn read_begin(&self) -> u32 {
        loop {
            let v = self.0.load(Ordering::Acquire);
            if v % 2 == 0 {
                return v;
            }
            cpu_relax();
        }
    }

    /// Returns `true` if a read section starting at `start` observed a
    /// concurrent write and must retry.
    pub fn read_retry(&self, start: u32) -> bool {
        crate::atomic::rmb();
        self.0.load(Ordering::Acquire) != start
    }

    /// Runs `f` in a read section, retrying until it observes a single
    /// writer epoch, and returns its result.
    pub fn read_loop<T>(&self, mut f: impl FnMut() -> T) -> T {
        loop {
            let start = self.read_begin();
            let v = f();
            if !self.read_retry(start) {
                return v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn read_without_writer_is_stable() {
        let seq = SeqCounter::new();
        let v = seq.read_loop(|| 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn reader_never_observes_torn_pair() {
        // Writer keeps two words equal; readers must never see them differ.
        let seq = Arc::new(SeqCounter::new());
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let writer = {
            let (seq, a, b, stop) = (seq.clone(), a.clone(), b.clone(), stop.clone());
            std::thread::spawn(move || {
                for i in 1..5000u64 {
                    seq.write_begin();
                    a.store(i, Ordering::Relaxed);
                    b.store(i, Ordering::Relaxed);
                    seq.write_end();
                }
                stop.store(true, Ordering::Release);
            })
        };

        while !stop.load(Ordering::Acquire) {
            let (x, y) = seq.read_loop(|| (a.load(Ordering::Relaxed), b.load(Ordering::Relaxed)));
            assert_eq!(x, y, "torn read escaped the retry loop");
        }
        writer.join().unwrap();
    }
}
