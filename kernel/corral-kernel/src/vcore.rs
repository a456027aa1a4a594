//! Kernel side of the vcore state machine.
//!
//! Notification raising, revocation (preempt) request and acknowledge,
//! core yields, and the direct pcore handoff between vcores. All of
//! these run on threads that are currently executing as a vcore; the
//! parking/resuming goes through the vcore slot's gate, and map updates
//! are serialized by the per-process vcore lock plus the coremap
//! seqlock.

use std::sync::Arc;

use corral_abi::Errno;
use corral_abi::ctx::{VcoreRet, VcoreRun, raise_teardown};
use corral_abi::event::{EV_CHECK_MSGS, EV_PREEMPT_PENDING, EV_VCORE_PREEMPT, EventMsg};
use corral_core::time::{read_tsc, usec2tsc};

use crate::Machine;
use crate::proc::Proc;

/// What an interrupt-point poll observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// Nothing pending.
    Clear,
    /// A notification is pending and notifications are enabled.
    Notif,
    /// The kernel wants this pcore back.
    Preempt,
}

impl Machine {
    /// Interrupt-point check for code executing as (proc, vcoreid).
    ///
    /// Teardown of a dying process is taken here directly (the calling
    /// thread unwinds); revocation outranks notification.
    pub fn poll_vcore(&self, proc: &Arc<Proc>, vcoreid: u32) -> PollResult {
        if proc.dying() {
            raise_teardown();
        }
        if proc.vcore(vcoreid).preempt_requested() {
            return PollResult::Preempt;
        }
        let vcpd = proc.procdata().vcpd(vcoreid);
        if vcpd.notif_pending() && !vcpd.notif_disabled() {
            return PollResult::Notif;
        }
        PollResult::Clear
    }

    /// Raises a notification at a vcore: sets `notif_pending` and, when
    /// the vcore is online with notifications enabled, "IPIs" it (the
    /// flag is observed at the vcore's next interrupt point).
    pub fn notify_vcore(&self, proc: &Arc<Proc>, vcoreid: u32) {
        let vcpd = proc.procdata().vcpd(vcoreid);
        vcpd.set_notif_pending(true);
        // The model's IPI is the pending flag itself; a masked vcore
        // will find it on re-enable or at vcore entry.
    }

    /// Posts the advisory revocation warning for a pcore: the owning
    /// vcore gets `preempt_pending` and an `EV_PREEMPT_PENDING` event,
    /// and the hard revoke fires at the deadline.
    pub fn preempt_core_deadline(&self, pcoreid: u32, warn_usec: u64) {
        let Some((proc, vcoreid)) = self.vcore_on_pcore(pcoreid) else {
            return;
        };
        let deadline = read_tsc() + usec2tsc(warn_usec);
        proc.procinfo().vcoremap(vcoreid).set_preempt_pending(deadline);
        let msg = EventMsg {
            ev_type: EV_PREEMPT_PENDING,
            ev_arg1: 0,
            ev_arg2: vcoreid,
            ev_arg3: deadline,
            ev_arg4: 0,
        };
        self.send_kernel_event(&proc, &msg, vcoreid);
        self.arm_preempt_deadline(pcoreid, deadline);
    }

    /// Immediately revokes a pcore: accounting plus the request word the
    /// running vcore honors at its next interrupt point.
    ///
    /// Returns `false` if the pcore is not currently granted.
    pub fn preempt_core(&self, pcoreid: u32) -> bool {
        let Some((proc, vcoreid)) = self.vcore_on_pcore(pcoreid) else {
            return false;
        };
        log::debug!(
            "preempting pcore {pcoreid} (pid {} vcore {vcoreid})",
            proc.pid()
        );
        proc.procinfo().vcoremap(vcoreid).inc_preempts_sent();
        proc.vcore(vcoreid).set_preempt_req(true);
        true
    }

    /// Resolves which (process, vcore) currently holds a pcore.
    pub fn vcore_on_pcore(&self, pcoreid: u32) -> Option<(Arc<Proc>, u32)> {
        let pid = self.inner().sched.alloc_pid_of(pcoreid)?;
        let proc = self.lookup_proc(pid)?;
        let entry = proc.procinfo().pcoremap(pcoreid);
        if entry.valid() {
            let vcoreid = entry.vcoreid();
            Some((proc, vcoreid))
        } else {
            None
        }
    }

    /// Acknowledges a revocation after the running context saved itself:
    /// the map bookkeeping plus the preempt notice to the rest of the
    /// process. `in_vcore_ctx` records that vcore context itself froze.
    ///
    /// The caller must follow up by handing the pcore back: through
    /// [`preempt_park`](Self::preempt_park) when called on the vcore
    /// thread, or through the frozen uthread's own gate.
    pub fn preempt_ack(&self, proc: &Arc<Proc>, vcoreid: u32, in_vcore_ctx: bool) {
        let slot = proc.vcore(vcoreid);
        slot.set_preempt_req(false);
        {
            let _g = proc.vcore_lock.lock();
            let pi = proc.procinfo();
            pi.coremap_write(|| {
                let entry = pi.vcoremap(vcoreid);
                pi.pcoremap(entry.pcoreid()).clear();
                entry.set_preempt_pending(0);
                // The vcore stays valid: mapped-but-preempted. The
                // sent/done gap closes when it is restarted.
            });
        }
        if in_vcore_ctx {
            proc.procdata().vcpd(vcoreid).set_vcore_ctx_saved(true);
        }
        // Tell the rest of the process: recovery handlers restart us.
        let preempt_msg = EventMsg {
            ev_type: EV_VCORE_PREEMPT,
            ev_arg1: 0,
            ev_arg2: vcoreid,
            ev_arg3: 0,
            ev_arg4: 0,
        };
        self.spam_proc_event(proc, &preempt_msg);
        let check_msg = EventMsg {
            ev_type: EV_CHECK_MSGS,
            ev_arg1: 0,
            ev_arg2: vcoreid,
            ev_arg3: 0,
            ev_arg4: 0,
        };
        self.spam_proc_event(proc, &check_msg);
    }

    /// Hands the preempted vcore's pcore back and parks until restart.
    /// Runs on the vcore-context thread: mid-stack for a vcore-context
    /// preemption (resumes exactly here), at the top of the entry loop
    /// for a uthread-context one (fresh entry on restart).
    pub fn preempt_park(&self, proc: &Arc<Proc>, vcoreid: u32, in_vcore_ctx: bool) {
        let vcpd = proc.procdata().vcpd(vcoreid);
        match proc.vcore(vcoreid).gate.yield_back(VcoreRet::Preempted) {
            VcoreRun::Grant => {
                if in_vcore_ctx {
                    vcpd.set_vcore_ctx_saved(false);
                }
            }
            VcoreRun::Teardown => raise_teardown(),
        }
    }

    /// Voluntarily gives the calling vcore's pcore back to the kernel
    /// and parks until the vcore is granted a core again.
    ///
    /// Returns `Ok(false)` without yielding when `being_nice` found no
    /// posted revocation warning, or when a notification is pending (go
    /// drain events first). `Ok(true)` means the vcore was offline and
    /// has been restarted.
    pub fn sys_proc_yield(
        &self,
        proc: &Arc<Proc>,
        vcoreid: u32,
        being_nice: bool,
    ) -> Result<bool, Errno> {
        let pi = proc.procinfo();
        let vcpd = proc.procdata().vcpd(vcoreid);
        if being_nice && pi.vcoremap(vcoreid).preempt_pending().is_none() {
            return Ok(false);
        }
        if vcpd.notif_pending() {
            return Ok(false);
        }
        // A voluntary yield satisfies any in-flight revocation: the core
        // is coming back either way, and a stale request must not fire
        // against a future grant of this vcore.
        let slot = proc.vcore(vcoreid);
        let pcoreid = {
            let _g = proc.vcore_lock.lock();
            let entry = pi.vcoremap(vcoreid);
            let pcoreid = entry.pcoreid();
            pi.coremap_write(|| {
                if slot.preempt_requested() {
                    slot.set_preempt_req(false);
                    if entry.preempted() {
                        entry.inc_preempts_done();
                    }
                }
                pi.pcoremap(pcoreid).clear();
                entry.set_unmapped();
                entry.set_preempt_pending(0);
                pi.set_num_vcores(pi.num_vcores() - 1);
            });
            pcoreid
        };
        let went_waiting = if pi.is_mcp() {
            pi.num_vcores() == 0
                && proc
                    .set_state_if(|s| !s.is_dying(), crate::proc::ProcState::Waiting)
                    .is_ok()
        } else {
            proc.set_state_if(|s| !s.is_dying(), crate::proc::ProcState::Waiting)
                .is_ok()
        };
        // Close the lost-wakeup window: a notification that raced in
        // before we went WAITING would find a non-waiting process and
        // never wake us. Seeing it here aborts the yield.
        corral_core::atomic::wrmb();
        if went_waiting && vcpd.notif_pending() {
            {
                let _g = proc.vcore_lock.lock();
                pi.coremap_write(|| {
                    pi.vcoremap(vcoreid).set_mapped(pcoreid);
                    pi.pcoremap(pcoreid).set(vcoreid);
                    pi.set_num_vcores(pi.num_vcores() + 1);
                });
            }
            // A racing wakeup may have flipped us runnable already;
            // either way we are running again.
            let (back, from) = if pi.is_mcp() {
                (
                    crate::proc::ProcState::RunningM,
                    crate::proc::ProcState::RunnableM,
                )
            } else {
                (
                    crate::proc::ProcState::RunningS,
                    crate::proc::ProcState::RunnableS,
                )
            };
            let _ = proc.set_state_if(
                |s| s == crate::proc::ProcState::Waiting || s == from,
                back,
            );
            return Ok(false);
        }
        match proc.vcore(vcoreid).gate.yield_back(VcoreRet::CoreYielded) {
            VcoreRun::Grant => Ok(true),
            VcoreRun::Teardown => raise_teardown(),
        }
    }

    /// Rebinds the caller's pcore to a preempted vcore (`target`).
    ///
    /// Bookkeeping only: the caller must follow up by handing the core
    /// through its gate with [`VcoreRet::ChangeTo`] (vcore context) or
    /// through its uthread gate (uthread context with notifs disabled).
    ///
    /// With `enable_my_notif` the caller unmaps entirely (it will
    /// restart fresh at vcore entry); otherwise it becomes
    /// mapped-but-preempted and later resumes exactly where it froze.
    pub fn sys_change_vcore(
        &self,
        proc: &Arc<Proc>,
        my_vcoreid: u32,
        target: u32,
        enable_my_notif: bool,
    ) -> Result<(), Errno> {
        if my_vcoreid == target {
            return Err(Errno::EINVAL);
        }
        let pi = proc.procinfo();
        let _g = proc.vcore_lock.lock();
        let tgt = pi.vcoremap(target);
        if !tgt.valid() || !tgt.preempted() {
            return Err(Errno::EAGAIN);
        }
        pi.coremap_write(|| {
            let me = pi.vcoremap(my_vcoreid);
            let pcore = me.pcoreid();
            if enable_my_notif {
                me.set_unmapped();
                pi.set_num_vcores(pi.num_vcores() - 1);
            } else {
                me.inc_preempts_sent();
            }
            tgt.set_mapped(pcore);
            tgt.inc_preempts_done();
            pi.pcoremap(pcore).set(target);
        });
        log::trace!(
            "pid {}: vcore {} hands its pcore to vcore {}",
            proc.pid(),
            my_vcoreid,
            target
        );
        Ok(())
    }

    /// Hands the calling vcore's pcore through its gate and parks.
    /// Returns when the vcore is next granted a core.
    ///
    /// Must run on the thread executing as (proc, vcoreid)'s vcore
    /// context.
    pub fn vcore_handoff(&self, proc: &Arc<Proc>, vcoreid: u32, ret: VcoreRet) {
        match proc.vcore(vcoreid).gate.yield_back(ret) {
            VcoreRun::Grant => {}
            VcoreRun::Teardown => raise_teardown(),
        }
    }
}
