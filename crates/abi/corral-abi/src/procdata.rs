//! The read-write process data region.
//!
//! One preempt-data block per possible vcore plus the process-wide
//! resource desires. This is where the notification protocol lives: the
//! `notif_disabled`/`notif_pending` pair, the context save slots, the
//! single-slot spam-indir cell, and the vcore's built-in public mailbox.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use corral_core::SpinLock;
use corral_core::config::MAX_VCORES;
use corral_event::{EvMbox, MboxKind};

use crate::NR_RES;
use crate::ctx::UserContext;
use crate::event::EvqId;

/// Per-vcore shared state (one per possible vcore, embedded in procdata).
pub struct PreemptData {
    /// While true, the kernel will not deliver notifications; the vcore
    /// is in vcore context.
    notif_disabled: AtomicBool,
    /// A notification arrived; vcore entry must drain events before
    /// popping a uthread.
    notif_pending: AtomicBool,
    /// Notif save slot: the uthread context interrupted by a
    /// notification or a preemption taken in uthread context.
    uthread_ctx: SpinLock<Option<UserContext>>,
    /// Whether vcore context itself is suspended mid-preemption (its
    /// state lives on the parked vcore-context stack).
    vcore_ctx_saved: AtomicBool,
    /// Opaque TLS descriptor for vcore context.
    vcore_tls_desc: AtomicU64,
    /// Single-slot spam-indir cell: an encoded [`EvqId`], 0 when empty.
    spam_indir: AtomicU64,
    /// The vcore's built-in public mailbox (UCQ).
    ev_mbox_public: EvMbox,
}

impl PreemptData {
    fn new() -> Self {
        Self {
            notif_disabled: AtomicBool::new(false),
            notif_pending: AtomicBool::new(false),
            uthread_ctx: SpinLock::new(None),
            vcore_ctx_saved: AtomicBool::new(false),
            vcore_tls_desc: AtomicU64::new(0),
            spam_indir: AtomicU64::new(0),
            ev_mbox_public: EvMbox::new(MboxKind::Ucq),
        }
    }

    /// Whether notifications are masked (vcore context).
    pub fn notif_disabled(&self) -> bool {
        self.notif_disabled.load(Ordering::Acquire)
    }

    /// Masks or unmasks notifications.
    pub fn set_notif_disabled(&self, disabled: bool) {
        self.notif_disabled.store(disabled, Ordering::SeqCst);
    }

    /// Whether a notification is pending.
    pub fn notif_pending(&self) -> bool {
        self.notif_pending.load(Ordering::Acquire)
    }

    /// Raises or clears the pending-notification flag.
    pub fn set_notif_pending(&self, pending: bool) {
        self.notif_pending.store(pending, Ordering::SeqCst);
    }

    /// Stores a context into the notif save slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is occupied; overwriting a saved context would
    /// lose register state and is protocol misuse.
    pub fn save_uthread_ctx(&self, ctx: UserContext) {
        let mut slot = self.uthread_ctx.lock();
        assert!(slot.is_none(), "notif save slot clobbered");
        *slot = Some(ctx);
    }

    /// Takes the saved context out of the notif slot.
    pub fn take_uthread_ctx(&self) -> Option<UserContext> {
        self.uthread_ctx.lock().take()
    }

    /// Whether the notif slot holds a context.
    pub fn has_uthread_ctx(&self) -> bool {
        self.uthread_ctx.lock().is_some()
    }

    /// Marks vcore context as suspended by a preemption.
    pub fn set_vcore_ctx_saved(&self, saved: bool) {
        self.vcore_ctx_saved.store(saved, Ordering::SeqCst);
    }

    /// Whether vcore context is suspended mid-preemption.
    pub fn vcore_ctx_saved(&self) -> bool {
        self.vcore_ctx_saved.load(Ordering::Acquire)
    }

    /// The vcore-context TLS descriptor.
    pub fn vcore_tls_desc(&self) -> u64 {
        self.vcore_tls_desc.load(Ordering::Acquire)
    }

    /// Installs the vcore-context TLS descriptor.
    pub fn set_vcore_tls_desc(&self, desc: u64) {
        self.vcore_tls_desc.store(desc, Ordering::Release);
    }

    /// Tries to deposit an indirection into the spam slot. Fails if the
    /// slot is occupied; the producer then tries another vcore.
    pub fn try_spam_indir(&self, evq: EvqId) -> bool {
        self.spam_indir
            .compare_exchange(0, evq.encode(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Drains the spam slot.
    pub fn take_spam_indir(&self) -> Option<EvqId> {
        EvqId::decode(self.spam_indir.swap(0, Ordering::AcqRel))
    }

    /// The vcore's built-in public mailbox.
    pub fn ev_mbox_public(&self) -> &EvMbox {
        &self.ev_mbox_public
    }
}

/// The process data region.
pub struct ProcData {
    /// Resource amounts the process wants (user-writable).
    res_desires: [AtomicU32; NR_RES],
    /// Per-event-type kernel routing table: the ev_q the kernel should
    /// deliver events of that type to (encoded [`EvqId`], 0 = none).
    kernel_evts: [AtomicU64; corral_core::config::NR_EVENT_TYPES],
    vcpd: Vec<PreemptData>,
}

impl Default for ProcData {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcData {
    /// Builds the region with one preempt-data block per possible vcore.
    pub fn new() -> Self {
        Self {
            res_desires: [const { AtomicU32::new(0) }; NR_RES],
            kernel_evts: [const { AtomicU64::new(0) }; corral_core::config::NR_EVENT_TYPES],
            vcpd: (0..MAX_VCORES).map(|_| PreemptData::new()).collect(),
        }
    }

    /// Binds `evq` as the kernel's delivery target for `ev_type`.
    /// Returns the previously bound queue, if any.
    pub fn set_kernel_evq(&self, ev_type: u16, evq: Option<EvqId>) -> Option<EvqId> {
        let word = evq.map_or(0, EvqId::encode);
        EvqId::decode(self.kernel_evts[usize::from(ev_type)].swap(word, Ordering::AcqRel))
    }

    /// The ev_q bound for a kernel event type.
    pub fn kernel_evq(&self, ev_type: u16) -> Option<EvqId> {
        EvqId::decode(self.kernel_evts[usize::from(ev_type)].load(Ordering::Acquire))
    }

    /// The desired amount for a resource class.
    pub fn res_desire(&self, res: usize) -> u32 {
        self.res_desires[res].load(Ordering::Acquire)
    }

    /// Publishes a new desired amount (user side).
    pub fn set_res_desire(&self, res: usize, amt: u32) {
        self.res_desires[res].store(amt, Ordering::Release);
    }

    /// The preempt-data block for a vcore.
    pub fn vcpd(&self, vcoreid: u32) -> &PreemptData {
        &self.vcpd[vcoreid as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spam_slot_is_single_occupancy() {
        let pd = ProcData::new();
        let vcpd = pd.vcpd(0);
        assert!(vcpd.try_spam_indir(EvqId(4)));
        assert!(!vcpd.try_spam_indir(EvqId(5)), "second deposit must fail");
        assert_eq!(vcpd.take_spam_indir(), Some(EvqId(4)));
        assert_eq!(vcpd.take_spam_indir(), None);
    }

    #[test]
    fn notif_flags_default_to_enabled_idle() {
        let pd = ProcData::new();
        let vcpd = pd.vcpd(1);
        assert!(!vcpd.notif_disabled());
        assert!(!vcpd.notif_pending());
    }
}
