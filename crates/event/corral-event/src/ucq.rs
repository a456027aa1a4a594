//! Unbounded concurrent queue.
//!
//! A linked chain of page-sized buffers, each a ring of message slots.
//! Producers reserve a slot with a single `fetch_add` on `prod_idx` and
//! fill it afterwards (reserve-then-fill); the slot's `ready` flag
//! publishes the fill. When a page runs out, exactly one producer (the
//! one whose reservation landed on the page boundary) installs the next
//! page, recycling a spare when one is cached. The consumer follows each
//! page header's `cons_next_pg` link and retires exhausted pages.
//!
//! Producers never block and never lose a message; memory use is
//! unbounded if the consumer falls behind, which is logged past
//! [`UCQ_WARN_THRESH`].
//!
//! All raw-pointer access to page memory is confined to this module.
//! Pages are only freed after the consumer has moved past them, and a
//! page cannot be passed while any reserved slot in it is unfilled, so
//! every dereference below targets live memory.

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use corral_core::SpinLock;
use corral_core::atomic::{cpu_relax, wmb};
use corral_core::config::{UCQ_PAGE_SIZE, UCQ_WARN_THRESH};

use crate::EventMsg;

/// Header at the start of every page, linking the chain for the consumer.
struct UcqPageHeader {
    /// Next page to consume, installed by the producer that grew the
    /// chain. Zero until then.
    cons_next_pg: AtomicU64,
}

/// One message slot: the payload plus its publication flag.
struct MsgContainer {
    msg: UnsafeCell<EventMsg>,
    ready: AtomicBool,
}

impl MsgContainer {
    const fn new() -> Self {
        Self {
            msg: UnsafeCell::new(EventMsg {
                ev_type: 0,
                ev_arg1: 0,
                ev_arg2: 0,
                ev_arg3: 0,
                ev_arg4: 0,
            }),
            ready: AtomicBool::new(false),
        }
    }
}

/// Messages per page.
const UCQ_SLOTS: usize =
    (UCQ_PAGE_SIZE - size_of::<UcqPageHeader>()) / size_of::<MsgContainer>();

/// A page of the queue. Page-aligned so a slot word can encode the page
/// address in its high bits and the slot index in the low 12.
#[repr(align(4096))]
struct UcqPage {
    header: UcqPageHeader,
    slots: [MsgContainer; UCQ_SLOTS],
}

impl UcqPage {
    fn new() -> Self {
        Self {
            header: UcqPageHeader {
                cons_next_pg: AtomicU64::new(0),
            },
            slots: [const { MsgContainer::new() }; UCQ_SLOTS],
        }
    }
}

/// Slot word → page base address.
fn slot_page(slot: u64) -> u64 {
    slot & !0xFFF
}

/// Slot word → in-page index.
#[expect(clippy::cast_possible_truncation, reason = "masked to 12 bits")]
fn slot_off(slot: u64) -> usize {
    (slot & 0xFFF) as usize
}

/// Slot word → message container pointer. Computes an address only.
fn slot_msg(slot: u64) -> *const MsgContainer {
    let pg = slot_page(slot) as *const UcqPage;
    // SAFETY: pointer arithmetic within one page; the caller guarantees
    // the slot word names a live page and an in-range index.
    unsafe { (&raw const (*pg).slots).cast::<MsgContainer>().add(slot_off(slot)) }
}

/// The unbounded concurrent queue mailbox.
pub struct Ucq {
    /// Next slot a producer will reserve (page | index).
    prod_idx: AtomicU64,
    /// Next slot the consumer will read (page | index).
    cons_idx: AtomicU64,
    /// A retired page cached for reuse, or zero.
    spare_pg: AtomicU64,
    /// Pages allocated beyond the first (growth accounting).
    nr_extra_pgs: AtomicUsize,
    /// Raised if producer reservations ever run away past the page
    /// index space; indicates a wedged page install.
    prod_overflow: AtomicBool,
    /// Serializes consumers; producers are lock-free.
    cons_lock: SpinLock<()>,
}

impl Default for Ucq {
    fn default() -> Self {
        Self::new()
    }
}

impl Ucq {
    /// Creates an empty queue with one page.
    pub fn new() -> Self {
        let pg = alloc_page();
        Self {
            prod_idx: AtomicU64::new(pg),
            cons_idx: AtomicU64::new(pg),
            spare_pg: AtomicU64::new(0),
            nr_extra_pgs: AtomicUsize::new(0),
            prod_overflow: AtomicBool::new(false),
            cons_lock: SpinLock::new(()),
        }
    }

    /// Deposits `msg`. Never fails, never blocks on the consumer.
    pub fn post(&self, msg: &EventMsg) {
        let my_slot = loop {
            let slot = self.prod_idx.fetch_add(1, Ordering::AcqRel);
            let idx = slot_off(slot);
            if idx < UCQ_SLOTS {
                break slot;
            }
            if idx == UCQ_SLOTS {
                // Our reservation landed exactly on the boundary: we are
                // the producer responsible for growing the chain.
                break self.install_next_page(slot_page(slot));
            }
            if idx > UCQ_SLOTS + 512 {
                // Far past the boundary: the installer should have swung
                // prod_idx long ago.
                self.prod_overflow.store(true, Ordering::Release);
                log::warn!("ucq: producer overflow, waiting on page install");
            }
            // Late loser: wait for the installer to publish the new page,
            // then reserve again.
            while slot_page(self.prod_idx.load(Ordering::Acquire)) == slot_page(slot) {
                cpu_relax();
            }
        };
        // SAFETY: we exclusively reserved `my_slot` on a live page.
        let mc = unsafe { &*slot_msg(my_slot) };
        // SAFETY: reserve-then-fill; no other producer writes this slot,
        // and the consumer waits for `ready` before reading.
        unsafe {
            *mc.msg.get() = *msg;
        }
        wmb();
        mc.ready.store(true, Ordering::Release);
    }

    /// Installs a fresh page after `old_pg` and claims its slot 0.
    fn install_next_page(&self, old_pg: u64) -> u64 {
        let new_pg = match self.spare_pg.swap(0, Ordering::AcqRel) {
            0 => {
                let pg = alloc_page();
                let extra = self.nr_extra_pgs.fetch_add(1, Ordering::Relaxed) + 1;
                if extra > UCQ_WARN_THRESH {
                    log::warn!("ucq: {extra} extra pages, consumer may be wedged");
                }
                pg
            }
            pg => pg,
        };
        // Link before publishing so the consumer can always follow.
        // SAFETY: old_pg is the page our reservation overflowed; it stays
        // live until the consumer passes it, which requires this link.
        unsafe {
            (*(old_pg as *const UcqPage))
                .header
                .cons_next_pg
                .store(new_pg, Ordering::Release);
        }
        wmb();
        // Slot 0 is ours; hand out slot 1 onward.
        self.prod_idx.store(new_pg | 1, Ordering::Release);
        new_pg
    }

    /// Extracts the oldest message, or `None` if the queue is empty.
    ///
    /// Consumers are serialized internally; messages from a single
    /// producer are returned in the order they were posted.
    pub fn extract_one(&self) -> Option<EventMsg> {
        let _g = self.cons_lock.lock();
        loop {
            let my_slot = self.cons_idx.load(Ordering::Acquire);
            if slot_off(my_slot) >= UCQ_SLOTS {
                // Page exhausted. If producers are still on this page the
                // queue is empty; otherwise follow the link.
                let prod = self.prod_idx.load(Ordering::Acquire);
                if slot_page(prod) == slot_page(my_slot) {
                    return None;
                }
                let old_pg = slot_page(my_slot);
                let next = loop {
                    // SAFETY: old_pg is the page the consumer is standing
                    // on; it is not freed until retire_page below.
                    let next = unsafe {
                        (*(old_pg as *const UcqPage))
                            .header
                            .cons_next_pg
                            .load(Ordering::Acquire)
                    };
                    if next != 0 {
                        break next;
                    }
                    // The installer is between its reservation and the
                    // link store.
                    cpu_relax();
                };
                self.cons_idx.store(next, Ordering::Release);
                self.retire_page(old_pg);
                continue;
            }
            if my_slot == self.prod_idx.load(Ordering::Acquire) {
                return None;
            }
            // The slot is reserved; wait out the producer's fill window.
            // SAFETY: reserved slots live until consumed.
            let mc = unsafe { &*slot_msg(my_slot) };
            while !mc.ready.load(Ordering::Acquire) {
                cpu_relax();
            }
            // SAFETY: ready is set after the fill; we own the consume side.
            let msg = unsafe { *mc.msg.get() };
            mc.ready.store(false, Ordering::Release);
            self.cons_idx.store(my_slot + 1, Ordering::Release);
            return Some(msg);
        }
    }

    /// Recycles a fully-consumed page as the spare, or frees it.
    fn retire_page(&self, pg: u64) {
        // SAFETY: the consumer has moved past pg; no producer can hold a
        // reservation in it (all its slots were consumed).
        unsafe {
            (*(pg as *const UcqPage))
                .header
                .cons_next_pg
                .store(0, Ordering::Release);
        }
        if self
            .spare_pg
            .compare_exchange(0, pg, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // SAFETY: pg came from alloc_page and is unreachable now.
            unsafe { drop(Box::from_raw(pg as *mut UcqPage)) };
            self.nr_extra_pgs.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Returns `true` if no message is pending.
    pub fn is_empty(&self) -> bool {
        let cons = self.cons_idx.load(Ordering::Acquire);
        let prod = self.prod_idx.load(Ordering::Acquire);
        cons == prod || (slot_off(cons) >= UCQ_SLOTS && slot_page(cons) == slot_page(prod))
    }

    /// Pages currently allocated beyond the first.
    pub fn extra_pages(&self) -> usize {
        self.nr_extra_pgs.load(Ordering::Relaxed)
    }

    /// Message slots per page (sizing for growth-bound assertions).
    pub fn slots_per_page() -> usize {
        UCQ_SLOTS
    }
}

impl Drop for Ucq {
    fn drop(&mut self) {
        let mut pg = slot_page(*self.cons_idx.get_mut());
        while pg != 0 {
            // SAFETY: exclusive access in Drop; every live page is
            // reachable from the consumer page via cons_next_pg.
            let next = unsafe {
                (*(pg as *const UcqPage))
                    .header
                    .cons_next_pg
                    .load(Ordering::Acquire)
            };
            // SAFETY: pg was allocated by alloc_page and is owned by us.
            unsafe { drop(Box::from_raw(pg as *mut UcqPage)) };
            pg = next;
        }
        let spare = *self.spare_pg.get_mut();
        if spare != 0 {
            // SAFETY: the spare is ours and unlinked.
            unsafe { drop(Box::from_raw(spare as *mut UcqPage)) };
        }
    }
}

/// Allocates a zeroed, page-aligned page and leaks it to a raw address.
fn alloc_page() -> u64 {
    let pg = Box::into_raw(Box::new(UcqPage::new())) as u64;
    debug_assert_eq!(pg & 0xFFF, 0, "page allocation not page-aligned");
    pg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn msg(n: u64) -> EventMsg {
        EventMsg {
            ev_type: 1,
            ev_arg1: 0,
            ev_arg2: 0,
            ev_arg3: n,
            ev_arg4: 0,
        }
    }

    #[test]
    fn slots_per_page_is_sane() {
        assert!(UCQ_SLOTS > 8);
        assert!(UCQ_SLOTS < 0xFFF);
    }

    #[test]
    fn fifo_within_one_page() {
        let ucq = Ucq::new();
        for i in 0..10 {
            ucq.post(&msg(i));
        }
        for i in 0..10 {
            assert_eq!(ucq.extract_one().unwrap().ev_arg3, i);
        }
        assert!(ucq.extract_one().is_none());
        assert!(ucq.is_empty());
    }

    #[test]
    fn fifo_across_page_boundaries() {
        let ucq = Ucq::new();
        let n = (UCQ_SLOTS * 3 + 7) as u64;
        for i in 0..n {
            ucq.post(&msg(i));
        }
        for i in 0..n {
            assert_eq!(ucq.extract_one().unwrap().ev_arg3, i, "gap or reorder at {i}");
        }
        assert!(ucq.is_empty());
    }

    #[test]
    fn drained_pages_are_recycled() {
        let ucq = Ucq::new();
        // Interleave so the consumer keeps up: page growth should reuse
        // the spare instead of accumulating.
        for round in 0..20u64 {
            for i in 0..UCQ_SLOTS as u64 {
                ucq.post(&msg(round * 1000 + i));
            }
            while ucq.extract_one().is_some() {}
        }
        assert!(ucq.extra_pages() <= 2, "pages leaked: {}", ucq.extra_pages());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let ucq = Arc::new(Ucq::new());
        const PRODUCERS: u64 = 4;
        const PER: u64 = 5000;
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let ucq = ucq.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER {
                    ucq.post(&msg(p * PER + i));
                }
            }));
        }
        let consumer = {
            let ucq = ucq.clone();
            std::thread::spawn(move || {
                let mut last_seen = [None::<u64>; PRODUCERS as usize];
                let mut count = 0;
                while count < PRODUCERS * PER {
                    if let Some(m) = ucq.extract_one() {
                        #[expect(clippy::cast_possible_truncation, reason = "small index")]
                        let p = (m.ev_arg3 / PER) as usize;
                        let seq = m.ev_arg3 % PER;
                        if let Some(prev) = last_seen[p] {
                            assert!(seq > prev, "per-producer order violated");
                        }
                        last_seen[p] = Some(seq);
                        count += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        consumer.join().unwrap();
        assert!(ucq.is_empty());
    }
}
