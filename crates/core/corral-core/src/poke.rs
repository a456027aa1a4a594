//! Coalescing re-entry guard.
//!
//! Serializes calls into a function that many parties may want run but
//! that must never run twice concurrently, e.g. the core allocator's
//! scheduling pass. Any number of pokers may arrive while a run is in
//! flight; they coalesce into at most one follow-up run.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::atomic::{cmb, wmb, wrmb};

/// Tracker state for a poked function.
///
/// Guarantees: after `poke` returns, the function has run (or is running,
/// or will run) at a point later than the poke; at most one instance runs
/// at a time; concurrent pokes during a run cause exactly one re-run.
#[derive(Default)]
pub struct PokeTracker {
    need_to_run: AtomicBool,
    run_in_progress: AtomicBool,
}

impl PokeTracker {
    /// Creates an idle tracker.
    pub const fn new() -> Self {
        Self {
            need_to_run: AtomicBool::new(false),
            run_in_progress: AtomicBool::new(false),
        }
    }

    /// Requests a run of `func`, coalescing with any concurrent requests.
    ///
    /// The caller either becomes the runner (and loops while more pokes
    /// arrive) or returns immediately, leaving its request for the
    /// current runner to observe.
    pub fn poke(&self, func: impl Fn()) {
        self.need_to_run.store(true, Ordering::SeqCst);
        loop {
            if self
                .run_in_progress
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                // Someone else is the runner; our need_to_run store is
                // visible to them before they release the run flag.
                return;
            }
            // We are the runner. Clear the request before running so a
            // poke arriving mid-run is not lost.
            self.need_to_run.store(false, Ordering::SeqCst);
            cmb();
            func();
            wmb();
            self.run_in_progress.store(false, Ordering::Release);
            // Re-check after releasing: a poker that failed the CAS
            // above may have left a request behind.
            wrmb();
            if !self.need_to_run.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn poke_runs_at_least_once() {
        let tracker = PokeTracker::new();
        let runs = AtomicUsize::new(0);
        tracker.poke(|| {
            runs.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_pokes_coalesce() {
        let tracker = Arc::new(PokeTracker::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            let runs = runs.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    tracker.poke(|| {
                        runs.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let total = runs.load(Ordering::SeqCst);
        // Coalescing can collapse runs but never below one, and the
        // tracker must not invent extra runs beyond one per poke.
        assert!(total >= 1);
        assert!(total <= 800);
    }
}
