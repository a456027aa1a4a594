//! The thread0 scheduler: what an SCP runs before linking a real 2LS.
//!
//! One uthread, no queues, no locks. Vcore entry either pops thread0
//! (when it is runnable) or yields the core and drains events on the
//! way back in. Blocking a syscall arms the shared completion ev_q; the
//! completion event marks thread0 runnable again.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use corral_abi::event::EV_SYSCALL;
use corral_abi::{EventQueue, EvqFlags, Syscall};
use corral_event::MboxKind;
use corral_kernel::Machine;

use crate::UserRuntime;
use crate::uthread::{SchedDecision, SchedOps, Uthread, UthreadFlags, uthread_create};

/// The trivial single-uthread scheduler.
pub struct Thread0 {
    uth: OnceLock<Arc<Uthread>>,
    is_blocked: AtomicBool,
    sysc_evq: OnceLock<Arc<EventQueue>>,
}

impl Thread0 {
    fn new() -> Self {
        Self {
            uth: OnceLock::new(),
            is_blocked: AtomicBool::new(false),
            sysc_evq: OnceLock::new(),
        }
    }

    /// The program's only uthread.
    pub fn main_uthread(&self) -> Option<&Arc<Uthread>> {
        self.uth.get()
    }
}

impl SchedOps for Thread0 {
    fn sched_entry(&self, _rt: &Arc<UserRuntime>, _vcoreid: u32) -> SchedDecision {
        if let Some(uth) = self.uth.get() {
            if !self.is_blocked.load(Ordering::Acquire)
                && !uth.flags().contains(UthreadFlags::DEAD)
                && uth.flags().contains(UthreadFlags::SAVED)
            {
                return SchedDecision::Run(uth.clone());
            }
        }
        // Nothing runnable: give the core back; events wake us.
        SchedDecision::Idle
    }

    fn thread_runnable(&self, _rt: &Arc<UserRuntime>, _uth: &Arc<Uthread>) {
        self.is_blocked.store(false, Ordering::Release);
    }

    fn thread_paused(&self, _rt: &Arc<UserRuntime>, _uth: &Arc<Uthread>) {
        self.is_blocked.store(false, Ordering::Release);
    }

    fn thread_has_blocked(&self, _rt: &Arc<UserRuntime>, _uth: &Arc<Uthread>) {
        self.is_blocked.store(true, Ordering::Release);
    }

    fn thread_blockon_sysc(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>, sysc: &Arc<Syscall>) {
        self.thread_has_blocked(rt, uth);
        let evq = self.sysc_evq.get().expect("thread0 ev_q missing");
        if !sysc.register_evq(evq.id()) {
            // Completion beat us; don't sleep.
            self.thread_runnable(rt, uth);
        }
    }

    fn thread_refl_fault(&self, rt: &Arc<UserRuntime>, _uth: &Arc<Uthread>, fault: &str) {
        // An SCP has no one to hand faults to.
        log::error!("pid {}: unhandled fault: {fault}", rt.proc().pid());
        rt.exit(-1);
    }
}

/// Boots an SCP whose single uthread runs `main`. The process exits
/// with status 0 when `main` returns.
pub fn spawn_scp(
    machine: &Machine,
    main: impl FnOnce(Arc<UserRuntime>) + Send + 'static,
) -> Arc<UserRuntime> {
    let ops = Arc::new(Thread0::new());
    let rt = UserRuntime::create(machine, ops.clone());

    // The completion queue: payload-free, indirection-alerted, and a
    // wakeup source for the (often WAITING) process.
    let evq = rt.get_eventq(
        MboxKind::Bitmap,
        EvqFlags::INDIR | EvqFlags::WAKEUP | EvqFlags::FALLBACK,
    );
    evq.set_ev_vcore(0);
    ops.sysc_evq.set(evq).ok().expect("spawn_scp called twice");

    {
        let ops2 = ops.clone();
        rt.register_ev_handler(
            EV_SYSCALL,
            Arc::new(move |_rt, _msg, _t| {
                // Single uthread: any completion means it can run.
                ops2.is_blocked.store(false, Ordering::Release);
            }),
        );
    }

    let rt_main = rt.clone();
    let uth = uthread_create(&rt, move || {
        main(rt_main.clone());
        rt_main.exit(0);
    });
    ops.uth.set(uth).ok().expect("spawn_scp called twice");

    rt.start();
    rt
}
