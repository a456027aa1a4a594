//! User-side event reception.
//!
//! Vcore entry drains its public mailbox and spam slot here; INDIR
//! payloads are chased to their ev_q and every extracted message runs
//! its registered handler chain (in vcore context, notifications
//! masked). Uthreads block on event queues through a wakeup controller
//! that marks them runnable exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use corral_abi::event::{EV_CHECK_MSGS, EV_EVENT, EV_VCORE_PREEMPT, EventMsg};
use corral_abi::{EventQueue, EvqFlags, EvqId};
use corral_core::SpinLock;
use corral_event::MboxKind;
use std::collections::BTreeMap;

use crate::UserRuntime;
use crate::uthread::{Uthread, uthread_yield};
use crate::vcore::{current_uthread, in_vcore_context};

/// An event handler. Runs in vcore context; must not block.
pub type EvHandlerFn = Arc<dyn Fn(&Arc<UserRuntime>, &EventMsg, u16) + Send + Sync>;

/// Token identifying a registered handler for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Per-process handler chains, keyed by event type.
#[derive(Default)]
pub struct HandlerTable {
    chains: SpinLock<BTreeMap<u16, Vec<(u64, EvHandlerFn)>>>,
    next_id: AtomicU64,
}

impl HandlerTable {
    fn register(&self, ev_type: u16, handler: EvHandlerFn) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.chains
            .lock()
            .entry(ev_type)
            .or_default()
            .push((id, handler));
        HandlerId(id)
    }

    fn deregister(&self, ev_type: u16, id: HandlerId) -> bool {
        let mut chains = self.chains.lock();
        let Some(chain) = chains.get_mut(&ev_type) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|(hid, _)| *hid != id.0);
        chain.len() != before
    }

    fn chain_for(&self, ev_type: u16) -> Vec<EvHandlerFn> {
        self.chains
            .lock()
            .get(&ev_type)
            .map(|c| c.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default()
    }
}

impl UserRuntime {
    /// Allocates and registers an event queue.
    pub fn get_eventq(&self, kind: MboxKind, flags: EvqFlags) -> Arc<EventQueue> {
        let evq = Arc::new(EventQueue::new(kind, flags));
        self.proc().evqs.insert(evq.clone());
        evq
    }

    /// An event queue aimed at a particular vcore (alerts land in that
    /// vcore's public mailbox).
    pub fn get_eventq_vcpd(&self, vcoreid: u32, flags: EvqFlags) -> Arc<EventQueue> {
        let evq = self.get_eventq(MboxKind::Ucq, flags | EvqFlags::INDIR);
        evq.set_ev_vcore(vcoreid);
        evq
    }

    /// Retires an event queue. In-flight indirections become inert; the
    /// queue memory lives until the last reference drops.
    pub fn put_eventq(&self, evq: &Arc<EventQueue>) {
        self.proc().evqs.remove(evq.id());
    }

    /// Routes kernel events of `ev_type` to a fresh vcpd-aimed queue.
    pub fn enable_kevent(&self, ev_type: u16, vcoreid: u32, flags: EvqFlags) -> Arc<EventQueue> {
        let evq = self.get_eventq_vcpd(vcoreid, flags);
        self.proc()
            .procdata()
            .set_kernel_evq(ev_type, Some(evq.id()));
        evq
    }

    /// Stops routing kernel events of `ev_type`; returns the old queue
    /// id, which the caller still owns.
    pub fn disable_kevent(&self, ev_type: u16) -> Option<EvqId> {
        self.proc().procdata().set_kernel_evq(ev_type, None)
    }

    /// Adds a handler to the chain for `ev_type`.
    pub fn register_ev_handler(&self, ev_type: u16, handler: EvHandlerFn) -> HandlerId {
        self.handlers.register(ev_type, handler)
    }

    /// Removes a handler registered earlier.
    pub fn deregister_ev_handler(&self, ev_type: u16, id: HandlerId) -> bool {
        self.handlers.deregister(ev_type, id)
    }

    /// Posts a message into the calling vcore's own public mailbox.
    pub fn send_self_vc_msg(&self, msg: &EventMsg) {
        let vcoreid = crate::vcore::vcore_id();
        self.proc()
            .procdata()
            .vcpd(vcoreid)
            .ev_mbox_public()
            .post(msg);
    }

    /// Drains this vcore's public mailbox and spam slot. Returns how
    /// many messages were handled.
    pub fn handle_events(&self, vcoreid: u32) -> usize {
        let mut n = self.handle_vcpd_mbox(vcoreid);
        while let Some(evq_id) = self.proc().procdata().vcpd(vcoreid).take_spam_indir() {
            n += 1;
            if let Some(evq) = self.proc().evqs.get(evq_id) {
                self.handle_event_q(&evq);
            }
        }
        n
    }

    /// Drains a vcore's public mailbox (possibly a remote one, for
    /// preemption recovery). Returns how many messages were handled.
    pub fn handle_vcpd_mbox(&self, vcoreid: u32) -> usize {
        let mbox = self.proc().procdata().vcpd(vcoreid).ev_mbox_public();
        let mut n = 0;
        while let Some(msg) = mbox.extract_one() {
            n += 1;
            if msg.ev_type == EV_EVENT {
                if let Some(evq) = self.proc().evqs.get(EvqId(msg.ev_arg2)) {
                    self.handle_event_q(&evq);
                }
            } else {
                self.run_handlers(&msg);
            }
        }
        n
    }

    /// Services one ev_q: wakes any blocked-uthread controller, or
    /// drains messages through the handler chains.
    pub fn handle_event_q(&self, evq: &Arc<EventQueue>) {
        evq.clear_alert();
        if evq.has_wakeup() {
            // A blocked uthread owns the messages; just wake it.
            evq.fire_wakeup();
            return;
        }
        while let Some(msg) = evq.mbox().extract_one() {
            self.run_handlers(&msg);
        }
    }

    fn run_handlers(&self, msg: &EventMsg) {
        let chain = self.handlers.chain_for(msg.ev_type);
        if chain.is_empty() {
            log::trace!(
                "pid {}: unhandled event type {}",
                self.proc().pid(),
                msg.ev_type
            );
        }
        let this = self.arc();
        for handler in chain {
            handler(&this, msg, msg.ev_type);
        }
    }

    /// Installs the substrate's own handlers: preemption recovery and
    /// remote-mailbox checks. Called once at runtime construction.
    pub(crate) fn register_builtin_handlers(&self) {
        self.register_ev_handler(
            EV_VCORE_PREEMPT,
            Arc::new(|rt, msg, _t| {
                let rem = msg.ev_arg2;
                if rem == crate::vcore::vcore_id() {
                    return;
                }
                // If the preempted vcore had an interrupted uthread in
                // its notif slot, reattach and requeue it.
                if let Some((uth, ctx)) = rt.steal_interrupted(rem) {
                    log::debug!("recovering uthread {} from vcore {rem}", uth.id());
                    uth.reattach_ctx(ctx);
                    rt.ops().thread_paused(rt, &uth);
                }
            }),
        );
        self.register_ev_handler(
            EV_CHECK_MSGS,
            Arc::new(|rt, msg, _t| {
                let rem = msg.ev_arg2;
                if rem != crate::vcore::vcore_id() {
                    rt.handle_vcpd_mbox(rem);
                }
            }),
        );
    }
}

// ── Blocking on event queues ─────────────────────────────────────────

enum BlockonState {
    Attached,
    Parked,
    Done,
}

/// Wakeup controller: marks the blocked uthread runnable exactly once,
/// no matter how many queues fire.
struct BlockonCtl {
    state: SpinLock<BlockonState>,
    uth: Arc<Uthread>,
}

impl BlockonCtl {
    fn fire(&self, rt: &Arc<UserRuntime>) {
        let wake = {
            let mut s = self.state.lock();
            match *s {
                BlockonState::Attached => {
                    *s = BlockonState::Done;
                    false
                }
                BlockonState::Parked => {
                    *s = BlockonState::Done;
                    true
                }
                BlockonState::Done => false,
            }
        };
        if wake {
            rt.ops().thread_runnable(rt, &self.uth);
        }
    }
}

/// Non-blocking poll of several event queues: extracts the first
/// pending message, if any.
pub fn uth_check_evqs(evqs: &[Arc<EventQueue>]) -> Option<(EventMsg, EvqId)> {
    for evq in evqs {
        if let Some(msg) = evq.mbox().extract_one() {
            return Some((msg, evq.id()));
        }
    }
    None
}

/// Blocks the calling uthread until any of `evqs` receives a message;
/// returns the message and the queue that fired. A second queue firing
/// later leaves its message in place.
pub fn uth_blockon_evqs(rt: &Arc<UserRuntime>, evqs: &[Arc<EventQueue>]) -> (EventMsg, EvqId) {
    assert!(!in_vcore_context(), "blockon from vcore context");
    loop {
        if let Some(hit) = uth_check_evqs(evqs) {
            return hit;
        }
        let uth = current_uthread().expect("blockon outside a uthread");
        let ctl = Arc::new(BlockonCtl {
            state: SpinLock::new(BlockonState::Attached),
            uth,
        });
        for evq in evqs {
            let ctl = ctl.clone();
            evq.set_wakeup(Arc::new(move |evq_ref| {
                if !evq_ref.mbox().is_empty() {
                    if let Some(rt) = crate::vcore::current_rt() {
                        ctl.fire(&rt);
                    }
                }
            }));
        }
        // Re-check after arming: a delivery between the first check and
        // the controller attach must not be lost.
        if let Some(hit) = uth_check_evqs(evqs) {
            for evq in evqs {
                evq.clear_wakeup();
            }
            return hit;
        }
        let ctl2 = ctl.clone();
        let rt2 = rt.clone();
        uthread_yield(true, move |uth| {
            rt2.ops().thread_has_blocked(&rt2, uth);
            let wake = {
                let mut s = ctl2.state.lock();
                match *s {
                    BlockonState::Attached => {
                        *s = BlockonState::Parked;
                        false
                    }
                    BlockonState::Done => true,
                    BlockonState::Parked => false,
                }
            };
            if wake {
                // The controller fired before we parked; rerun us.
                rt2.ops().thread_runnable(&rt2, uth);
            }
        });
        // Woken: detach and re-check (a spurious wake retries).
        for evq in evqs {
            evq.clear_wakeup();
        }
    }
}
