//! Coalescing event queue.
//!
//! A dense array of per-type "sticky status" slots plus a ring of posted
//! indices. N posts of the same type fold into one observation (bitwise
//! OR or saturating-free ADD of `ev_arg2`, per queue); the blob argument
//! is last-write-wins. The ring only exists to spare the consumer a scan:
//! if it overflows, `ring_overflowed` forces a linear sweep of the event
//! array bounded by `max_event_ever`, so no distinct type is ever lost.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use corral_core::SpinLock;
use corral_core::atomic::{cpu_relax, wmb, wrmb};

use crate::EventMsg;

/// How duplicate posts of one type are folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeqOp {
    /// `coalesce |= ev_arg2` (flag-style events).
    Or,
    /// `coalesce += ev_arg2` (counter-style events).
    Add,
}

/// Per-type slot: the folded payload and its ring-sync bit.
struct CeqEvent {
    coalesce: AtomicU64,
    blob_data: AtomicU64,
    /// Whether this type's index is (believed) present in the ring.
    idx_posted: AtomicBool,
}

impl CeqEvent {
    const fn new() -> Self {
        Self {
            coalesce: AtomicU64::new(0),
            blob_data: AtomicU64::new(0),
            idx_posted: AtomicBool::new(false),
        }
    }
}

/// The coalescing event queue mailbox.
pub struct Ceq {
    events: Box<[CeqEvent]>,
    /// Highest type ever posted; bounds overflow-recovery scans.
    max_event_ever: AtomicU32,
    /// Ring of posted type indices; -1 marks an empty slot.
    ring: Box<[AtomicI32]>,
    op: CeqOp,
    /// Producers set this when the ring is full; forces a linear scan.
    ring_overflowed: AtomicBool,
    /// Consumer is mid-sweep of the events array.
    overflow_recovery: AtomicBool,
    /// Next sweep position, so one extract call returns one event.
    last_recovered: AtomicU32,
    prod_idx: AtomicU64,
    cons_pub_idx: AtomicU64,
    cons_pvt_idx: AtomicU64,
    /// Serializes consumers (the producer side is lock-free).
    cons_lock: SpinLock<()>,
}

impl Ceq {
    /// Creates a queue coalescing with `op`, accepting types below
    /// `nr_events`, with a power-of-two ring of `ring_sz` indices.
    pub fn new(op: CeqOp, nr_events: usize, ring_sz: u32) -> Self {
        assert!(ring_sz.is_power_of_two(), "ceq ring size must be a power of two");
        Self {
            events: (0..nr_events).map(|_| CeqEvent::new()).collect(),
            max_event_ever: AtomicU32::new(0),
            ring: (0..ring_sz).map(|_| AtomicI32::new(-1)).collect(),
            op,
            ring_overflowed: AtomicBool::new(false),
            overflow_recovery: AtomicBool::new(false),
            last_recovered: AtomicU32::new(0),
            prod_idx: AtomicU64::new(0),
            cons_pub_idx: AtomicU64::new(0),
            cons_pvt_idx: AtomicU64::new(0),
            cons_lock: SpinLock::new(()),
        }
    }

    /// Returns the fold operation.
    pub fn op(&self) -> CeqOp {
        self.op
    }

    fn ring_mask(&self) -> u64 {
        self.ring.len() as u64 - 1
    }

    /// Deposits `msg`, folding into the slot for its type.
    ///
    /// Returns `false` if the type is out of range for this queue.
    pub fn post(&self, msg: &EventMsg) -> bool {
        let idx = usize::from(msg.ev_type);
        let Some(ev) = self.events.get(idx) else {
            return false;
        };
        match self.op {
            CeqOp::Or => ev.coalesce.fetch_or(u64::from(msg.ev_arg2), Ordering::AcqRel),
            CeqOp::Add => ev.coalesce.fetch_add(u64::from(msg.ev_arg2), Ordering::AcqRel),
        };
        ev.blob_data.store(msg.ev_arg3, Ordering::Release);
        self.max_event_ever.fetch_max(msg.ev_type.into(), Ordering::AcqRel);
        wmb();
        // One winner per quiet period pushes the index into the ring; the
        // consumer clears idx_posted before draining the payload, so a
        // later post re-arms it.
        if !ev.idx_posted.swap(true, Ordering::AcqRel) {
            self.ring_post(idx);
        }
        true
    }

    /// Pushes a type index into the ring, or records overflow.
    fn ring_post(&self, idx: usize) {
        loop {
            let pidx = self.prod_idx.load(Ordering::Acquire);
            let pub_idx = self.cons_pub_idx.load(Ordering::Acquire);
            if pidx.wrapping_sub(pub_idx) >= self.ring.len() as u64 {
                self.ring_overflowed.store(true, Ordering::Release);
                return;
            }
            if self
                .prod_idx
                .compare_exchange_weak(pidx, pidx + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                #[expect(clippy::cast_possible_truncation, reason = "ring index")]
                #[expect(clippy::cast_possible_wrap, reason = "type fits i32")]
                self.ring[(pidx & self.ring_mask()) as usize].store(idx as i32, Ordering::Release);
                return;
            }
        }
    }

    /// Extracts one coalesced event, if any.
    ///
    /// Drains the ring first; after an overflow, sweeps the events array
    /// one hit per call until the sweep completes.
    pub fn extract_one(&self) -> Option<EventMsg> {
        let _g = self.cons_lock.lock();
        // Ring first.
        loop {
            let pvt = self.cons_pvt_idx.load(Ordering::Acquire);
            if pvt == self.prod_idx.load(Ordering::Acquire) {
                break;
            }
            self.cons_pvt_idx.store(pvt + 1, Ordering::Release);
            let slot = &self.ring[(pvt & self.ring_mask()) as usize];
            let idx = loop {
                let v = slot.load(Ordering::Acquire);
                if v >= 0 {
                    break v;
                }
                // Producer won the reservation but has not stored yet.
                cpu_relax();
            };
            slot.store(-1, Ordering::Release);
            self.cons_pub_idx.store(pvt + 1, Ordering::Release);
            #[expect(clippy::cast_sign_loss, reason = "checked non-negative")]
            if let Some(msg) = self.extract_ev(idx as usize) {
                return Some(msg);
            }
            // Spurious ring entry (already swept during recovery); keep
            // draining.
        }
        // Ring drained. Enter or continue overflow recovery.
        if self.ring_overflowed.swap(false, Ordering::AcqRel)
            || self.overflow_recovery.load(Ordering::Acquire)
        {
            self.overflow_recovery.store(true, Ordering::Release);
            let start = self.last_recovered.load(Ordering::Relaxed) as usize;
            let max = (self.max_event_ever.load(Ordering::Acquire) as usize)
                .min(self.events.len() - 1);
            for idx in start..=max {
                if let Some(msg) = self.extract_ev(idx) {
                    #[expect(clippy::cast_possible_truncation, reason = "bounded by nr_events")]
                    self.last_recovered.store(idx as u32 + 1, Ordering::Relaxed);
                    return Some(msg);
                }
            }
            self.last_recovered.store(0, Ordering::Relaxed);
            self.overflow_recovery.store(false, Ordering::Release);
        }
        None
    }

    /// Drains the slot for `idx` into a message, or `None` if idle.
    fn extract_ev(&self, idx: usize) -> Option<EventMsg> {
        let ev = &self.events[idx];
        // Clear the sync bit before taking the payload so a racing post
        // after our swap re-posts the index to the ring.
        if !ev.idx_posted.swap(false, Ordering::AcqRel) {
            return None;
        }
        wrmb();
        let val = ev.coalesce.swap(0, Ordering::AcqRel);
        let blob = ev.blob_data.load(Ordering::Acquire);
        #[expect(clippy::cast_possible_truncation, reason = "coalesce folds u32 args")]
        let folded = val as u32;
        #[expect(clippy::cast_possible_truncation, reason = "bounded by nr_events")]
        let ev_type = idx as u16;
        Some(EventMsg {
            ev_type,
            ev_arg1: 0,
            ev_arg2: folded,
            ev_arg3: blob,
            ev_arg4: 0,
        })
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.cons_pvt_idx.load(Ordering::Acquire) == self.prod_idx.load(Ordering::Acquire)
            && !self.ring_overflowed.load(Ordering::Acquire)
            && !self.overflow_recovery.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ev_type: u16, arg2: u32, arg3: u64) -> EventMsg {
        EventMsg {
            ev_type,
            ev_arg1: 0,
            ev_arg2: arg2,
            ev_arg3: arg3,
            ev_arg4: 0,
        }
    }

    #[test]
    fn or_coalesces_flags() {
        let ceq = Ceq::new(CeqOp::Or, 16, 8);
        ceq.post(&msg(3, 0b001, 0));
        ceq.post(&msg(3, 0b100, 0));
        let m = ceq.extract_one().unwrap();
        assert_eq!(m.ev_type, 3);
        assert_eq!(m.ev_arg2, 0b101);
        assert!(ceq.extract_one().is_none());
    }

    #[test]
    fn add_coalesces_counters() {
        let ceq = Ceq::new(CeqOp::Add, 16, 8);
        for _ in 0..10 {
            ceq.post(&msg(5, 3, 0));
        }
        let m = ceq.extract_one().unwrap();
        assert_eq!(m.ev_arg2, 30);
    }

    #[test]
    fn blob_is_last_write_wins() {
        let ceq = Ceq::new(CeqOp::Or, 16, 8);
        ceq.post(&msg(1, 0, 111));
        ceq.post(&msg(1, 0, 222));
        assert_eq!(ceq.extract_one().unwrap().ev_arg3, 222);
    }

    #[test]
    fn distinct_types_all_observed() {
        let ceq = Ceq::new(CeqOp::Or, 32, 16);
        for t in 0..20u16 {
            ceq.post(&msg(t, 1, 0));
        }
        let mut seen = [false; 32];
        while let Some(m) = ceq.extract_one() {
            seen[usize::from(m.ev_type)] = true;
        }
        assert!(seen[..20].iter().all(|&s| s));
    }

    #[test]
    fn ring_overflow_recovers_by_scanning() {
        // Ring of 4, but 12 distinct types: most posts overflow the ring.
        let ceq = Ceq::new(CeqOp::Or, 16, 4);
        for t in 0..12u16 {
            ceq.post(&msg(t, 1 << (t % 8), 0));
        }
        let mut seen = 0;
        while let Some(m) = ceq.extract_one() {
            assert!(m.ev_type < 12);
            seen += 1;
        }
        assert_eq!(seen, 12, "overflow lost distinct types");
        assert!(ceq.is_empty());
    }

    #[test]
    fn out_of_range_type_is_rejected() {
        let ceq = Ceq::new(CeqOp::Or, 8, 4);
        assert!(!ceq.post(&msg(9, 1, 0)));
    }

    #[test]
    fn repost_after_extract_is_observed() {
        let ceq = Ceq::new(CeqOp::Add, 8, 4);
        ceq.post(&msg(2, 1, 0));
        assert_eq!(ceq.extract_one().unwrap().ev_arg2, 1);
        ceq.post(&msg(2, 5, 0));
        assert_eq!(ceq.extract_one().unwrap().ev_arg2, 5);
    }
}
