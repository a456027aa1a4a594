//! Event numbering, queue flags, and the event queue descriptor.
//!
//! An event queue is a routing descriptor owned by its consumer: it says
//! where messages land (the mailbox), how delivery behaves (the flags),
//! and which vcore to aim at. The kernel writes through it on the
//! process's behalf and never blocks doing so.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use corral_core::SpinLock;
use corral_event::{EvMbox, MboxKind};

pub use corral_event::EventMsg;

// ── Reserved event types (fixed ABI) ─────────────────────────────────────

/// Not an event.
pub const EV_NONE: u16 = 0;
/// Meta-event: "an event queue has something pending" (INDIR payload).
pub const EV_EVENT: u16 = 1;
/// User-to-user IPI.
pub const EV_USER_IPI: u16 = 2;
/// The kernel will revoke a vcore soon; yield nicely before the deadline.
pub const EV_PREEMPT_PENDING: u16 = 3;
/// Check another vcore's mailbox (spam fallback marker).
pub const EV_CHECK_MSGS: u16 = 4;
/// A syscall completed; `ev_arg3` references the syscall.
pub const EV_SYSCALL: u16 = 5;
/// A kernel alarm fired; `ev_arg2` carries the alarm id.
pub const EV_ALARM: u16 = 6;
/// A vcore was preempted; `ev_arg2` carries the vcoreid.
pub const EV_VCORE_PREEMPT: u16 = 7;
/// POSIX-style signal delivery.
pub const EV_POSIX_SIGNAL: u16 = 8;
/// First number available for application-defined events.
pub const EV_FIRST_USER: u16 = 16;

bitflags::bitflags! {
    /// Delivery behavior of an event queue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvqFlags: u32 {
        /// IPI the target vcore after depositing.
        const IPI = 1 << 0;
        /// Record only "type occurred"; drop the payload.
        const NOMSG = 1 << 1;
        /// Rotate the target vcore per delivery.
        const ROUNDROBIN = 1 << 2;
        /// Deposit a pointer to the ev_q into the vcore's public mailbox
        /// instead of the message itself.
        const INDIR = 1 << 3;
        /// If the chosen vcore can't receive, try any runnable vcore.
        const FALLBACK = 1 << 4;
        /// Last resort: deposit into some runnable vcore's public mailbox.
        const SPAM_PUBLIC = 1 << 5;
        /// With INDIR: spam the indirection through per-vcore spam slots.
        const SPAM_INDIR = 1 << 6;
        /// Delivery makes a WAITING process runnable.
        const WAKEUP = 1 << 7;
        /// Let the kernel pick an appropriate vcore instead of `ev_vcore`.
        const VCORE_APPRO = 1 << 8;
    }
}

/// Handle to an event queue registered in a process's ev_q arena.
///
/// Indirection payloads and shared-memory slots carry this id rather
/// than a pointer; a torn-down queue leaves stale ids dangling safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EvqId(pub u32);

impl EvqId {
    /// Encodes as a nonzero word for single-slot cells (0 = empty).
    pub fn encode(self) -> u64 {
        u64::from(self.0) + 1
    }

    /// Decodes from a nonzero word.
    pub fn decode(word: u64) -> Option<Self> {
        match word {
            0 => None,
            w => u32::try_from(w - 1).ok().map(Self),
        }
    }
}

/// Wakeup hook attached to an ev_q by a blocked uthread controller.
pub type EvqWakeupFn = Arc<dyn Fn(&EventQueue) + Send + Sync>;

/// An event queue: mailbox plus routing policy.
///
/// Flags and mailbox kind are fixed at construction; consumers who want
/// to reconfigure must quiesce producers and build a new queue.
pub struct EventQueue {
    id: AtomicU32,
    mbox: EvMbox,
    flags: EvqFlags,
    ev_vcore: AtomicU32,
    /// Round-robin rotation state.
    rr_ctr: AtomicU32,
    /// Set while an INDIR for this queue is in flight; throttles
    /// duplicate indirections.
    alert_pending: AtomicBool,
    wakeup: SpinLock<Option<EvqWakeupFn>>,
}

/// Sentinel id before arena registration.
const EVQ_UNREGISTERED: u32 = u32::MAX;

impl EventQueue {
    /// Creates a queue with a fresh mailbox of `kind`.
    pub fn new(kind: MboxKind, flags: EvqFlags) -> Self {
        Self {
            id: AtomicU32::new(EVQ_UNREGISTERED),
            mbox: EvMbox::new(kind),
            flags,
            ev_vcore: AtomicU32::new(0),
            rr_ctr: AtomicU32::new(0),
            alert_pending: AtomicBool::new(false),
            wakeup: SpinLock::new(None),
        }
    }

    /// Records the arena id. Called once at registration.
    pub fn set_id(&self, id: EvqId) {
        let prev = self.id.swap(id.0, Ordering::Release);
        debug_assert_eq!(prev, EVQ_UNREGISTERED, "ev_q registered twice");
    }

    /// Returns the arena id.
    ///
    /// # Panics
    ///
    /// Panics if the queue was never registered; routing an unregistered
    /// queue is protocol misuse.
    pub fn id(&self) -> EvqId {
        let id = self.id.load(Ordering::Acquire);
        assert_ne!(id, EVQ_UNREGISTERED, "ev_q used before registration");
        EvqId(id)
    }

    /// Returns the delivery flags.
    pub fn flags(&self) -> EvqFlags {
        self.flags
    }

    /// Returns the mailbox.
    pub fn mbox(&self) -> &EvMbox {
        &self.mbox
    }

    /// Returns the preferred target vcore.
    pub fn ev_vcore(&self) -> u32 {
        self.ev_vcore.load(Ordering::Acquire)
    }

    /// Sets the preferred target vcore.
    pub fn set_ev_vcore(&self, vcoreid: u32) {
        self.ev_vcore.store(vcoreid, Ordering::Release);
    }

    /// Advances the round-robin counter and returns the rotation index.
    pub fn next_round_robin(&self) -> u32 {
        self.rr_ctr.fetch_add(1, Ordering::Relaxed)
    }

    /// Claims the right to post an INDIR for this queue. Returns `false`
    /// if one is already in flight (throttled).
    pub fn try_raise_alert(&self) -> bool {
        !self.alert_pending.swap(true, Ordering::AcqRel)
    }

    /// Clears the in-flight INDIR marker; called by the consumer once it
    /// has started draining the queue.
    pub fn clear_alert(&self) {
        self.alert_pending.store(false, Ordering::Release);
    }

    /// Installs a wakeup hook (blocked-uthread controller).
    pub fn set_wakeup(&self, hook: EvqWakeupFn) {
        *self.wakeup.lock() = Some(hook);
    }

    /// Removes the wakeup hook.
    pub fn clear_wakeup(&self) {
        *self.wakeup.lock() = None;
    }

    /// Whether a wakeup hook (blocked-uthread controller) is attached.
    pub fn has_wakeup(&self) -> bool {
        self.wakeup.lock().is_some()
    }

    /// Fires the wakeup hook, if any. Idempotency is the hook's problem;
    /// this may be called once per delivery and once per drain.
    pub fn fire_wakeup(&self) {
        let hook = self.wakeup.lock().clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evq_id_encoding_round_trips() {
        assert_eq!(EvqId::decode(EvqId(0).encode()), Some(EvqId(0)));
        assert_eq!(EvqId::decode(EvqId(41).encode()), Some(EvqId(41)));
        assert_eq!(EvqId::decode(0), None);
    }

    #[test]
    fn alert_throttles_until_cleared() {
        let q = EventQueue::new(MboxKind::Bitmap, EvqFlags::INDIR);
        assert!(q.try_raise_alert());
        assert!(!q.try_raise_alert());
        q.clear_alert();
        assert!(q.try_raise_alert());
    }

    #[test]
    #[should_panic(expected = "before registration")]
    fn unregistered_id_asserts() {
        let q = EventQueue::new(MboxKind::Bitmap, EvqFlags::empty());
        let _ = q.id();
    }
}
