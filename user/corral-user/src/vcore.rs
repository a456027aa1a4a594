//! Vcore context: the entry loop, thread identity, and interrupt points.
//!
//! Every granted core begins execution at [`UserRuntime::vcore_entry`]:
//! clear the pending-notification flag, drain events, resume an
//! interrupted uthread if one is parked in the notif slot, otherwise ask
//! the 2LS what to run. Identity (`vcore_id`, `in_vcore_context`,
//! `current_uthread`) is thread-local; a uthread refreshes it every time
//! its context is popped, because pops migrate across vcores.
//!
//! The kernel cannot interrupt host threads asynchronously, so all
//! notification and revocation delivery funnels through the interrupt
//! points here: [`cpu_relax_vc`] in spin loops and the checks at the top
//! of the entry loop.

use std::cell::RefCell;
use std::sync::Arc;

use corral_abi::ctx::{SuspendMsg, VcoreRet};
use corral_core::atomic::wrmb;
use corral_kernel::PollResult;

use crate::UserRuntime;
use crate::uthread::{SchedDecision, Uthread};

/// Thread-local identity of the executing context.
pub(crate) struct VcoreTls {
    pub(crate) rt: Arc<UserRuntime>,
    pub(crate) vcoreid: u32,
    pub(crate) in_vcore_ctx: bool,
    pub(crate) uthread: Option<Arc<Uthread>>,
}

thread_local! {
    static TLS: RefCell<Option<VcoreTls>> = const { RefCell::new(None) };
}

pub(crate) fn set_tls(tls: VcoreTls) {
    corral_kernel::percpu::set_current(tls.rt.proc().pid(), tls.vcoreid);
    TLS.with(|t| *t.borrow_mut() = Some(tls));
}

pub(crate) fn with_tls<R>(f: impl FnOnce(&mut VcoreTls) -> R) -> Option<R> {
    TLS.with(|t| t.borrow_mut().as_mut().map(f))
}

/// The vcore the calling context executes as.
///
/// # Panics
///
/// Panics outside process context.
pub fn vcore_id() -> u32 {
    with_tls(|t| t.vcoreid).expect("not in process context")
}

/// Like [`vcore_id`], but `None` outside process context (setup code on
/// plain host threads).
pub fn try_vcore_id() -> Option<u32> {
    with_tls(|t| t.vcoreid)
}

/// Whether the caller is in vcore context (notifications masked).
pub fn in_vcore_context() -> bool {
    with_tls(|t| t.in_vcore_ctx).unwrap_or(false)
}

/// The uthread the calling thread is executing, if any.
pub fn current_uthread() -> Option<Arc<Uthread>> {
    with_tls(|t| t.uthread.clone()).flatten()
}

/// The runtime of the calling process context.
pub(crate) fn current_rt() -> Option<Arc<UserRuntime>> {
    with_tls(|t| t.rt.clone())
}

/// The runtime of the calling process context (public probe for 2LS
/// and application code).
pub fn current_runtime() -> Option<Arc<UserRuntime>> {
    current_rt()
}

/// Spin-loop hint that doubles as an interrupt point: pending
/// notifications and revocations are taken here.
pub fn cpu_relax_vc() {
    core::hint::spin_loop();
    poll_interrupts();
}

/// Explicit interrupt point. Safe to call from any process context.
pub fn poll_interrupts() {
    let Some((rt, vcoreid, in_vc)) =
        with_tls(|t| (t.rt.clone(), t.vcoreid, t.in_vcore_ctx))
    else {
        return;
    };
    let proc = rt.proc().clone();
    match rt.machine().poll_vcore(&proc, vcoreid) {
        PollResult::Clear => {}
        PollResult::Preempt => {
            if in_vc {
                // Vcore context: freeze in place; resume right here when
                // the vcore is restarted.
                rt.machine().preempt_ack(&proc, vcoreid, true);
                rt.machine().preempt_park(&proc, vcoreid, true);
            } else {
                let uth = current_uthread().expect("uthread context without uthread");
                let vcpd = proc.procdata().vcpd(vcoreid);
                if vcpd.notif_disabled() {
                    // Uthread in a notif-disabled section: the whole
                    // vcore freezes mid-uthread.
                    rt.machine().preempt_ack(&proc, vcoreid, false);
                    uth.suspend(SuspendMsg::CoreFrozen(VcoreRet::Preempted));
                } else {
                    // Notification-style save: park the uthread's state
                    // in the notif slot and re-enter vcore context.
                    uth.save_to_notif_slot(&proc, vcoreid);
                    vcpd.set_notif_disabled(true);
                    uth.suspend(SuspendMsg::Preempted);
                }
            }
        }
        PollResult::Notif => {
            // Only reported for uthread context with notifs enabled.
            let uth = current_uthread().expect("notified without a uthread");
            let vcpd = proc.procdata().vcpd(vcoreid);
            uth.save_to_notif_slot(&proc, vcoreid);
            vcpd.set_notif_disabled(true);
            uth.suspend(SuspendMsg::Notified);
        }
    }
}

/// Makes sure the named vcore makes progress, handing it our pcore if
/// the kernel preempted it. The backbone of preemption detection and
/// recovery: lock spinners call this on the lockholder.
pub fn ensure_vcore_runs(target: u32) {
    let Some(rt) = current_rt() else { return };
    let proc = rt.proc().clone();
    let Some(my_vcoreid) = try_vcore_id() else {
        return;
    };
    if target == my_vcoreid || target >= proc.procinfo().max_vcores() {
        return;
    }
    let tgt = proc.procinfo().vcoremap(target);
    if !tgt.valid() || !tgt.preempted() {
        return;
    }
    // Hand our pcore over; we become mapped-but-preempted and resume
    // here when the kernel gives us a core again.
    if rt
        .machine()
        .sys_change_vcore(&proc, my_vcoreid, target, false)
        .is_err()
    {
        // Lost a race: the target got a core some other way.
        return;
    }
    if in_vcore_context() {
        rt.machine().vcore_handoff(
            &proc,
            my_vcoreid,
            VcoreRet::ChangeTo { target, enable_my_notif: false },
        );
    } else {
        let uth = current_uthread().expect("uthread context without uthread");
        uth.suspend(SuspendMsg::CoreFrozen(VcoreRet::ChangeTo {
            target,
            enable_my_notif: false,
        }));
    }
}

/// Makes every live-but-preempted vcore run. Linear and expensive; the
/// fallback for lock disciplines that cannot name a holder.
pub fn ensure_all_vcores_run() {
    let Some(rt) = current_rt() else { return };
    let pi = rt.proc().procinfo().clone();
    for v in 0..pi.max_vcores() {
        let e = pi.vcoremap(v);
        if e.valid() && e.preempted() {
            ensure_vcore_runs(v);
        }
    }
}

impl UserRuntime {
    /// The process's fixed vcore entry point. Runs the entry loop until
    /// teardown unwinds it.
    pub(crate) fn vcore_entry(&self, vcoreid: u32) {
        set_tls(VcoreTls {
            rt: self.arc(),
            vcoreid,
            in_vcore_ctx: true,
            uthread: None,
        });
        let proc = self.proc().clone();
        let vcpd = proc.procdata().vcpd(vcoreid);
        vcpd.set_vcore_tls_desc(u64::from(vcoreid) + 1);
        log::trace!("pid {} vcore {vcoreid}: entry", proc.pid());

        loop {
            poll_interrupts();
            debug_assert!(vcpd.notif_disabled(), "vcore context with notifs enabled");
            vcpd.set_notif_pending(false);
            wrmb();
            self.handle_events(vcoreid);

            // An interrupted uthread in the notif slot takes precedence
            // over the 2LS: taking the context is the claim that beats
            // racing preemption recoverers.
            if let Some(ctx) = proc.procdata().vcpd(vcoreid).take_uthread_ctx() {
                let uth = self
                    .vcore_local(vcoreid)
                    .current_uthread
                    .lock()
                    .clone()
                    .expect("notif slot ctx without current_uthread");
                self.run_popped(vcoreid, &uth, ctx);
                continue;
            }

            match self.ops().sched_entry(&self.arc(), vcoreid) {
                SchedDecision::Run(uth) => self.run_uthread_on(vcoreid, &uth),
                SchedDecision::Idle => {
                    match self.machine().sys_proc_yield(&proc, vcoreid, false) {
                        Ok(_restarted) => {}
                        Err(e) => log::warn!("vcore {vcoreid}: yield failed: {e}"),
                    }
                }
            }
        }
    }
}
