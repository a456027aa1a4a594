//! Event mailboxes.
//!
//! The three shared-memory mailbox disciplines the event fabric deposits
//! into, behind one tagged union:
//!
//! - **Bitmap**: one sticky bit per event type. Coalesces everything,
//!   loses payloads, never allocates.
//! - **UCQ**: unbounded concurrent queue of page-sized message rings.
//!   Lossless and FIFO per producer, allocates under load.
//! - **CEQ**: coalescing event queue, a dense per-type array plus an
//!   index ring. Merges duplicate types (OR or ADD) and survives ring
//!   overflow by falling back to a linear scan.
//!
//! Producers are the kernel posting on behalf of a process and never
//! block; consumers are vcore-context handlers. Consumer entry points are
//! serialized internally, producers are lock-free.

pub mod bitmap;
pub mod ceq;
pub mod ucq;

pub use bitmap::EvBitmap;
pub use ceq::{Ceq, CeqOp};
pub use ucq::Ucq;

/// A fixed-size event record.
///
/// `ev_type` selects the handler chain and indexes coalescing mailboxes;
/// the args are payload with per-type meaning (for syscall completions,
/// `ev_arg3` carries the syscall reference).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMsg {
    /// Event type number (fixed ABI, indexes handler chains).
    pub ev_type: u16,
    /// Small payload argument.
    pub ev_arg1: u16,
    /// Coalescable payload argument (CEQ folds this one).
    pub ev_arg2: u32,
    /// Wide payload argument (pointer-sized references go here).
    pub ev_arg3: u64,
    /// Second wide payload argument.
    pub ev_arg4: u64,
}

impl EventMsg {
    /// Builds a message carrying only a type.
    pub fn of_type(ev_type: u16) -> Self {
        Self {
            ev_type,
            ..Self::default()
        }
    }
}

/// Which mailbox discipline to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MboxKind {
    /// Sticky per-type bits.
    Bitmap,
    /// Unbounded concurrent queue.
    Ucq,
    /// Coalescing event queue with the given fold operation.
    Ceq(CeqOp),
}

/// A mailbox: a tagged union over the three disciplines.
pub enum EvMbox {
    /// Bitmap discipline.
    Bitmap(EvBitmap),
    /// UCQ discipline.
    Ucq(Ucq),
    /// CEQ discipline.
    Ceq(Ceq),
}

impl EvMbox {
    /// Creates a mailbox of the given kind with default sizing.
    pub fn new(kind: MboxKind) -> Self {
        match kind {
            MboxKind::Bitmap => Self::Bitmap(EvBitmap::new()),
            MboxKind::Ucq => Self::Ucq(Ucq::new()),
            MboxKind::Ceq(op) => Self::Ceq(Ceq::new(
                op,
                corral_core::config::NR_EVENT_TYPES,
                corral_core::config::CEQ_DEFAULT_RING_SZ,
            )),
        }
    }

    /// Returns the discipline tag.
    pub fn kind(&self) -> MboxKind {
        match self {
            Self::Bitmap(_) => MboxKind::Bitmap,
            Self::Ucq(_) => MboxKind::Ucq,
            Self::Ceq(c) => MboxKind::Ceq(c.op()),
        }
    }

    /// Deposits `msg`. Returns `false` only if the discipline cannot
    /// represent the message (e.g. CEQ type out of range); the producer
    /// treats that as a routing failure, not a panic.
    pub fn post(&self, msg: &EventMsg) -> bool {
        match self {
            Self::Bitmap(b) => {
                b.post(msg.ev_type);
                true
            }
            Self::Ucq(u) => {
                u.post(msg);
                true
            }
            Self::Ceq(c) => c.post(msg),
        }
    }

    /// Extracts one pending message, if any.
    ///
    /// Coalescing disciplines return a reconstructed message: bitmap
    /// yields only the type, CEQ yields the folded payload.
    pub fn extract_one(&self) -> Option<EventMsg> {
        match self {
            Self::Bitmap(b) => b.extract_one(),
            Self::Ucq(u) => u.extract_one(),
            Self::Ceq(c) => c.extract_one(),
        }
    }

    /// Returns `true` if nothing is pending.
    ///
    /// A `false` return is authoritative: a subsequent extract will
    /// observe some manifestation of the posted event unless another
    /// consumer gets there first.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bitmap(b) => b.is_empty(),
            Self::Ucq(u) => u.is_empty(),
            Self::Ceq(c) => c.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_dispatches_by_kind() {
        for kind in [MboxKind::Bitmap, MboxKind::Ucq, MboxKind::Ceq(CeqOp::Or)] {
            let mbox = EvMbox::new(kind);
            assert!(mbox.is_empty());
            assert!(mbox.post(&EventMsg::of_type(5)));
            assert!(!mbox.is_empty());
            let msg = mbox.extract_one().expect("posted message lost");
            assert_eq!(msg.ev_type, 5);
            assert!(mbox.extract_one().is_none());
        }
    }
}
