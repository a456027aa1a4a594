//! Saved user contexts and the resume/suspend protocol.
//!
//! A [`UserContext`] is the value form of a suspended computation: the
//! handle by which a saved uthread (or a parked vcore) is resumed, plus
//! the tag saying how it was saved and its ancillary (FP) state. Contexts
//! move through shared-memory slots (the per-vcore notif slot, a
//! uthread's own save slot) and can be popped from any pcore.
//!
//! In this machine model a context's "register file" is the stack of a
//! parked host thread; popping it is a strict handoff through
//! [`Handoff`]. The protocol messages here are plain data so both sides
//! of the kernel/user boundary can speak them.

use std::sync::Arc;

use corral_core::Handoff;

/// How a context was saved.
///
/// Mirrors the hardware/software trapframe split: a `Hardware` context
/// was taken involuntarily at an interrupt point (full state), a
/// `Software` context was saved cooperatively at a yield (callee-saved
/// state only). `Guest` is reserved for a virtual-machine subsystem this
/// runtime does not include; the variant is never constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxKind {
    /// Involuntary save (notification or preemption interrupt point).
    Hardware,
    /// Cooperative save at an explicit yield.
    Software,
    /// Reserved for guest contexts; never constructed here.
    Guest,
}

/// Ancillary (floating-point) state carried alongside a context.
///
/// The model keeps a small scratch register file so save/restore and
/// migration fidelity are observable in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AncillaryState {
    /// Scratch FP/vector registers.
    pub fp_regs: [u64; 8],
}

/// Message resuming a parked user context.
#[derive(Debug, Clone, Copy)]
pub enum ResumeMsg {
    /// Run, bound to the given vcore.
    Run {
        /// The vcore this context now executes as.
        vcoreid: u32,
    },
    /// The process is being torn down; unwind and exit.
    Teardown,
}

/// Message a running context hands back when it suspends.
#[derive(Debug, Clone, Copy)]
pub enum SuspendMsg {
    /// Cooperative yield. The context re-saved itself before suspending;
    /// the yield callback is stashed on the owning uthread.
    Yielded,
    /// The thread body returned; the context is dead.
    Exited,
    /// Stopped at an interrupt point by a pending notification after
    /// saving itself into the vcore's notif slot.
    Notified,
    /// Stopped at an interrupt point by a core revocation after saving
    /// itself into the vcore's notif slot.
    Preempted,
    /// The uthread hands the whole pcore back (via the vcore thread)
    /// while staying frozen mid-execution with notifs disabled; when the
    /// vcore is restarted, resume this uthread directly.
    CoreFrozen(VcoreRet),
    /// The uthread hands the pcore back after detaching: it saved its
    /// context into a shared slot, and a restarted vcore enters fresh.
    CoreDetached(VcoreRet),
}

/// Panic payload used to unwind user code during process teardown.
///
/// Raised by park/poll wrappers when they observe a teardown message or
/// a dying process; caught at thread tops and swallowed.
pub struct TeardownUnwind;

/// Raises the teardown unwind on the calling thread.
pub fn raise_teardown() -> ! {
    std::panic::panic_any(TeardownUnwind)
}

/// Gate type for uthread-level contexts.
pub type UthGate = Handoff<ResumeMsg, SuspendMsg>;

/// Message granting a pcore to a vcore-context thread.
#[derive(Debug, Clone, Copy)]
pub enum VcoreRun {
    /// The kernel bound this vcore to a pcore; run until the core is
    /// handed back.
    Grant,
    /// The process is being torn down; unwind and exit.
    Teardown,
}

/// Message a vcore-context thread hands back with its pcore.
#[derive(Debug, Clone, Copy)]
pub enum VcoreRet {
    /// The vcore yielded its core voluntarily.
    CoreYielded,
    /// The vcore honored a revocation; its state is saved.
    Preempted,
    /// The vcore hands its pcore directly to another vcore.
    ChangeTo {
        /// Vcore to run in our place.
        target: u32,
        /// Whether our own saved state may be discarded in favor of a
        /// fresh start at vcore entry.
        enable_my_notif: bool,
    },
    /// The process finished on this vcore.
    ProcExit {
        /// Program exit status.
        status: i64,
    },
}

/// Gate type for vcore-context threads.
pub type VcoreGate = Handoff<VcoreRun, VcoreRet>;

/// A saved user context: resume handle, save tag, ancillary state.
#[derive(Clone)]
pub struct UserContext {
    kind: CtxKind,
    gate: Arc<UthGate>,
    anc: AncillaryState,
}

impl core::fmt::Debug for UserContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UserContext")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl UserContext {
    /// Wraps a parked continuation as a saved context.
    pub fn new(kind: CtxKind, gate: Arc<UthGate>, anc: AncillaryState) -> Self {
        Self { kind, gate, anc }
    }

    /// Returns how this context was saved.
    pub fn kind(&self) -> CtxKind {
        self.kind
    }

    /// Returns the ancillary state saved with the context.
    pub fn ancillary(&self) -> &AncillaryState {
        &self.anc
    }

    /// Resumes the context bound to `vcoreid` and blocks until it
    /// suspends again. The resumption is bit-identical: the continuation
    /// picks up exactly where it was saved.
    pub fn pop(&self, vcoreid: u32) -> SuspendMsg {
        self.gate.call(ResumeMsg::Run { vcoreid })
    }

    /// Wakes the context for teardown without waiting for a reply.
    pub fn teardown(&self) {
        self.gate.post(ResumeMsg::Teardown);
    }

    /// Returns the underlying gate (for identity comparisons).
    pub fn gate(&self) -> &Arc<UthGate> {
        &self.gate
    }
}
