//! Kernel-side event delivery.
//!
//! Routing a message through an ev_q: deposit into the queue's mailbox,
//! then run the alert phase the queue's flags ask for (IPI, INDIR
//! indirection into a vcore's public mailbox, FALLBACK/SPAM retargeting
//! when the chosen vcore cannot receive), and finally wake the process
//! if the queue is a WAKEUP queue. The kernel writes into user-owned
//! mailboxes on the process's behalf and never blocks doing so.

use std::sync::Arc;

use corral_abi::event::{EV_EVENT, EventMsg};
use corral_abi::{EventQueue, EvqFlags, EvqId};

use crate::Machine;
use crate::proc::{Proc, ProcState};

impl Machine {
    /// Routes `msg` through the process's ev_q with id `evq_id`.
    ///
    /// A stale id (torn-down queue) or a dying process drops the message.
    pub fn send_event(&self, proc: &Arc<Proc>, evq_id: EvqId, msg: &EventMsg) {
        if proc.dying() {
            return;
        }
        let Some(evq) = proc.evqs.get(evq_id) else {
            log::debug!("pid {}: event to stale ev_q {:?} dropped", proc.pid(), evq_id);
            return;
        };
        self.send_event_q(proc, &evq, msg);
    }

    /// Routes `msg` through an ev_q the caller already resolved.
    pub fn send_event_q(&self, proc: &Arc<Proc>, evq: &Arc<EventQueue>, msg: &EventMsg) {
        let flags = evq.flags();
        let deliver = if flags.contains(EvqFlags::NOMSG) {
            EventMsg::of_type(msg.ev_type)
        } else {
            *msg
        };
        if !evq.mbox().post(&deliver) {
            log::warn!(
                "pid {}: ev_q {:?} mailbox rejected type {}",
                proc.pid(),
                evq.id(),
                msg.ev_type
            );
        }

        // Alert phase. (Wakeup controllers fire from vcore context when
        // the queue is serviced, never from the producer side.)
        let target = self.pick_target_vcore(proc, evq, flags);
        if flags.contains(EvqFlags::INDIR) {
            self.send_indir(proc, evq, target, flags);
        } else if flags.contains(EvqFlags::IPI) {
            if let Some(v) = self.alert_vcore(proc, target, flags) {
                self.notify_vcore(proc, v);
            }
        }

        if flags.contains(EvqFlags::WAKEUP) {
            self.proc_wakeup(proc);
        }
    }

    /// Delivers a kernel event (preempt warnings, `sys_notify`) through
    /// the ev_q the process registered for the type, if any.
    pub fn send_kernel_event(&self, proc: &Arc<Proc>, msg: &EventMsg, _hint_vcore: u32) {
        if usize::from(msg.ev_type) >= corral_core::config::NR_EVENT_TYPES {
            log::debug!("pid {}: kernel event type {} out of range", proc.pid(), msg.ev_type);
            return;
        }
        if let Some(evq_id) = proc.procdata().kernel_evq(msg.ev_type) {
            self.send_event(proc, evq_id, msg);
        } else {
            log::trace!(
                "pid {}: no ev_q bound for kernel event type {}; dropped",
                proc.pid(),
                msg.ev_type
            );
        }
    }

    /// Deposits `msg` into some runnable vcore's public mailbox and
    /// notifies it. Falls back to vcore 0's mailbox when the process has
    /// no online vcores (it will be drained at the next start).
    pub fn spam_proc_event(&self, proc: &Arc<Proc>, msg: &EventMsg) {
        let pd = proc.procdata();
        if let Some(v) = self.first_runnable_vcore(proc, None) {
            pd.vcpd(v).ev_mbox_public().post(msg);
            self.notify_vcore(proc, v);
        } else {
            pd.vcpd(0).ev_mbox_public().post(msg);
            pd.vcpd(0).set_notif_pending(true);
        }
        if proc.state() == ProcState::Waiting {
            self.proc_wakeup(proc);
        }
    }

    /// Chooses the initial target vcore for an alert.
    fn pick_target_vcore(&self, proc: &Arc<Proc>, evq: &EventQueue, flags: EvqFlags) -> u32 {
        // When both VCORE_APPRO and an explicit target are set, the
        // kernel's choice wins; callers are advised to pick one.
        if flags.contains(EvqFlags::VCORE_APPRO) {
            return self.first_runnable_vcore(proc, None).unwrap_or(0);
        }
        if flags.contains(EvqFlags::ROUNDROBIN) {
            let n = proc.procinfo().num_vcores().max(1);
            return evq.next_round_robin() % n;
        }
        evq.ev_vcore()
    }

    /// INDIR alert: put a pointer to the ev_q into a vcore's public
    /// mailbox (or spam slot), throttled to one in-flight indirection
    /// per queue.
    fn send_indir(&self, proc: &Arc<Proc>, evq: &Arc<EventQueue>, target: u32, flags: EvqFlags) {
        if !evq.try_raise_alert() {
            // An indirection is already pending; the consumer will see
            // this message when it drains the queue.
            return;
        }
        let indir = EventMsg {
            ev_type: EV_EVENT,
            ev_arg1: 0,
            ev_arg2: evq.id().0,
            ev_arg3: 0,
            ev_arg4: 0,
        };
        let pd = proc.procdata();

        if self.vcore_runnable(proc, target) {
            pd.vcpd(target).ev_mbox_public().post(&indir);
            // Only after the deposit is the IPI sent.
            if flags.contains(EvqFlags::IPI) {
                self.notify_vcore(proc, target);
            }
            return;
        }
        if flags.intersects(EvqFlags::FALLBACK | EvqFlags::SPAM_PUBLIC | EvqFlags::SPAM_INDIR) {
            if let Some(v) = self.first_runnable_vcore(proc, Some(target)) {
                if flags.contains(EvqFlags::SPAM_INDIR) && pd.vcpd(v).try_spam_indir(evq.id()) {
                    self.notify_vcore(proc, v);
                    return;
                }
                pd.vcpd(v).ev_mbox_public().post(&indir);
                self.notify_vcore(proc, v);
                return;
            }
        }
        // Nobody online: leave it in vcore 0's mailbox for wakeup.
        pd.vcpd(0).ev_mbox_public().post(&indir);
        pd.vcpd(0).set_notif_pending(true);
    }

    /// Resolves an alert target to a runnable vcore, honoring FALLBACK
    /// and SPAM_PUBLIC. Returns `None` if nobody can take the alert.
    fn alert_vcore(&self, proc: &Arc<Proc>, target: u32, flags: EvqFlags) -> Option<u32> {
        if self.vcore_runnable(proc, target) {
            return Some(target);
        }
        if flags.intersects(EvqFlags::FALLBACK | EvqFlags::SPAM_PUBLIC) {
            return self.first_runnable_vcore(proc, Some(target));
        }
        None
    }

    /// Whether a vcore can currently receive an alert: mapped and not
    /// mid-preemption.
    pub fn vcore_runnable(&self, proc: &Arc<Proc>, vcoreid: u32) -> bool {
        if vcoreid >= proc.procinfo().max_vcores() {
            return false;
        }
        proc.procinfo().coremap_read(|| {
            let e = proc.procinfo().vcoremap(vcoreid);
            e.valid() && !e.preempted()
        })
    }

    /// First runnable vcore, skipping `except`. The pick order is an
    /// implementation detail consumers must not rely on.
    pub fn first_runnable_vcore(&self, proc: &Arc<Proc>, except: Option<u32>) -> Option<u32> {
        let max = proc.procinfo().max_vcores();
        (0..max).find(|&v| Some(v) != except && self.vcore_runnable(proc, v))
    }

    /// Makes a WAITING process runnable again (WAKEUP delivery).
    pub fn proc_wakeup(&self, proc: &Arc<Proc>) {
        let is_mcp = proc.procinfo().is_mcp();
        let flipped = if is_mcp {
            proc.set_state_if(|s| s == ProcState::Waiting, ProcState::RunnableM)
        } else {
            proc.set_state_if(|s| s == ProcState::Waiting, ProcState::RunnableS)
        };
        if flipped.is_ok() {
            log::trace!("pid {}: woken", proc.pid());
            if !is_mcp {
                self.inner().sched.scp_runnable(proc.pid());
            }
            self.run_scheduler();
        }
    }
}
