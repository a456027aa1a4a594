//! Strict control handoff between two threads.
//!
//! The execution-transfer primitive behind core granting and context
//! popping: a caller hands a message to the parked owner and blocks until
//! the owner yields a reply back; exactly one side runs at a time. The
//! owner parks in [`Handoff::wait`] or [`Handoff::yield_back`] and is the
//! only thread that ever runs "inside" the handoff.
//!
//! Protocol discipline (enforced by callers, asserted here): at most one
//! caller is in [`Handoff::call`] at a time, and the owner never parks
//! twice without an intervening resume.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A two-party rendezvous channel carrying `In` toward the parked owner
/// and `Out` back toward the caller.
///
/// The owner-bound side is a small queue: an out-of-band message (e.g.
/// teardown) may be posted while a regular resume is in flight, and the
/// owner drains them in order.
pub struct Handoff<In, Out> {
    inner: Mutex<Slots<In, Out>>,
    cv: Condvar,
}

struct Slots<In, Out> {
    to_owner: VecDeque<In>,
    to_caller: Option<Out>,
}

impl<In, Out> Default for Handoff<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> Handoff<In, Out> {
    /// Creates an empty handoff.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                to_owner: VecDeque::new(),
                to_caller: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Caller side: resumes the owner with `msg` and blocks until the
    /// owner yields control back.
    ///
    /// If the owner already left a final reply (it exited before this
    /// call), that reply is returned immediately.
    pub fn call(&self, msg: In) -> Out {
        let mut g = self.inner.lock().unwrap();
        g.to_owner.push_back(msg);
        self.cv.notify_all();
        loop {
            if let Some(out) = g.to_caller.take() {
                return out;
            }
            g = self.cv.wait(g).unwrap();
        }
    }

    /// Caller side: resumes the owner with `msg` without waiting for a
    /// reply. Used for teardown, where the owner exits instead of
    /// yielding back.
    pub fn post(&self, msg: In) {
        let mut g = self.inner.lock().unwrap();
        g.to_owner.push_back(msg);
        self.cv.notify_all();
    }

    /// Owner side: parks until a caller resumes us.
    pub fn wait(&self) -> In {
        let mut g = self.inner.lock().unwrap();
        loop {
            if let Some(msg) = g.to_owner.pop_front() {
                return msg;
            }
            g = self.cv.wait(g).unwrap();
        }
    }

    /// Owner side: yields `out` to the waiting caller and parks until the
    /// next resume.
    pub fn yield_back(&self, out: Out) -> In {
        let mut g = self.inner.lock().unwrap();
        debug_assert!(g.to_caller.is_none(), "owner yielded twice");
        g.to_caller = Some(out);
        self.cv.notify_all();
        loop {
            if let Some(msg) = g.to_owner.pop_front() {
                return msg;
            }
            g = self.cv.wait(g).unwrap();
        }
    }

    /// Owner side: yields `out` to the waiting caller without parking.
    /// The owner must not touch the handoff again.
    pub fn finish(&self, out: Out) {
        let mut g = self.inner.lock().unwrap();
        debug_assert!(g.to_caller.is_none(), "owner finished twice");
        g.to_caller = Some(out);
        self.cv.notify_all();
    }

    /// Returns `true` if a resume message is waiting for the owner.
    pub fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().to_owner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn call_round_trips_through_owner() {
        let h: Arc<Handoff<u32, u32>> = Arc::new(Handoff::new());
        let owner = {
            let h = h.clone();
            std::thread::spawn(move || {
                let x = h.wait();
                let y = h.yield_back(x + 1);
                h.finish(y + 1);
            })
        };
        assert_eq!(h.call(10), 11);
        assert_eq!(h.call(20), 21);
        owner.join().unwrap();
    }

    #[test]
    fn strict_alternation_under_repetition() {
        let h: Arc<Handoff<u64, u64>> = Arc::new(Handoff::new());
        let owner = {
            let h = h.clone();
            std::thread::spawn(move || {
                let mut m = h.wait();
                loop {
                    if m == u64::MAX {
                        h.finish(0);
                        return;
                    }
                    m = h.yield_back(m * 2);
                }
            })
        };
        for i in 0..1000u64 {
            assert_eq!(h.call(i), i * 2);
        }
        h.call(u64::MAX);
        owner.join().unwrap();
    }
}
