//! The process timer chain.
//!
//! User code wants many alarms; the kernel device gives us one. The
//! chain keeps awaiters sorted by absolute TSC deadline and aims the
//! single backing device alarm at the head. The device's `EV_ALARM`
//! event drives a vcore-context handler that pops every expired awaiter
//! and runs its handler, one at a time, then reprograms the device.
//!
//! Cancellation races are first-class: an awaiter is on the chain, or
//! mid-fire (wait it out), or already gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use corral_abi::EvqFlags;
use corral_core::time::read_tsc;

use crate::UserRuntime;
use crate::spinlock::SpinPdr;
use crate::syscall::{devalarm_clone, devalarm_evqctl_write, devalarm_timer_write};
use crate::vcore::cpu_relax_vc;

/// Handler run (in vcore context) when an awaiter's deadline passes.
pub type AlarmHandlerFn = Arc<dyn Fn(&Arc<Awaiter>) + Send + Sync>;

/// One timed wakeup.
pub struct Awaiter {
    wake_up_time: AtomicU64,
    handler: AlarmHandlerFn,
    on_tchain: AtomicBool,
    firing: AtomicBool,
}

impl Awaiter {
    /// Builds an awaiter; arm it with [`TimerChain::set_alarm`].
    pub fn new(handler: AlarmHandlerFn) -> Arc<Self> {
        Arc::new(Self {
            wake_up_time: AtomicU64::new(0),
            handler,
            on_tchain: AtomicBool::new(false),
            firing: AtomicBool::new(false),
        })
    }

    /// The absolute TSC deadline this awaiter is (or was) armed for.
    pub fn wake_up_time(&self) -> u64 {
        self.wake_up_time.load(Ordering::Acquire)
    }

    /// Whether the awaiter is currently queued.
    pub fn on_tchain(&self) -> bool {
        self.on_tchain.load(Ordering::Acquire)
    }
}

struct ChainState {
    /// Sorted ascending by (wake_up_time, insertion order).
    awaiters: Vec<Arc<Awaiter>>,
    /// What the device alarm is currently programmed to, 0 if disarmed.
    programmed: u64,
}

/// The per-process timer chain over one kernel alarm.
pub struct TimerChain {
    rt: std::sync::Weak<UserRuntime>,
    alarm_id: u32,
    state: SpinPdr<ChainState>,
}

impl TimerChain {
    /// Clones a device alarm, binds its delivery to a fresh ev_q, and
    /// registers the chain's `EV_ALARM` handler.
    ///
    /// # Panics
    ///
    /// Panics if the alarm device refuses the setup; a process without
    /// its timer service cannot run timed code.
    pub fn init(rt: &Arc<UserRuntime>) -> Arc<Self> {
        let alarm_id = devalarm_clone(rt).expect("alarm device clone failed");
        let evq = rt.get_eventq_vcpd(
            0,
            EvqFlags::IPI | EvqFlags::FALLBACK | EvqFlags::SPAM_PUBLIC | EvqFlags::WAKEUP,
        );
        devalarm_evqctl_write(rt, alarm_id, evq.id()).expect("alarm ev_q binding failed");

        let chain = Arc::new(Self {
            rt: Arc::downgrade(rt),
            alarm_id,
            state: SpinPdr::new(ChainState {
                awaiters: Vec::new(),
                programmed: 0,
            }),
        });
        let chain2 = chain.clone();
        rt.register_ev_handler(
            corral_abi::event::EV_ALARM,
            Arc::new(move |_rt, msg, _t| {
                if msg.ev_arg2 == chain2.alarm_id {
                    chain2.trigger();
                }
            }),
        );
        chain
    }

    /// Arms `awaiter` for an absolute TSC deadline. Reprograms the
    /// device only when the new awaiter becomes the chain head.
    pub fn set_alarm(&self, awaiter: &Arc<Awaiter>, wake_up_time: u64) {
        assert!(!awaiter.on_tchain(), "awaiter already armed");
        awaiter.wake_up_time.store(wake_up_time, Ordering::Release);
        awaiter.on_tchain.store(true, Ordering::Release);
        let mut st = self.state.lock();
        let pos = st
            .awaiters
            .iter()
            .position(|a| a.wake_up_time() > wake_up_time)
            .unwrap_or(st.awaiters.len());
        st.awaiters.insert(pos, awaiter.clone());
        if pos == 0 {
            self.reprogram(&mut st, wake_up_time);
        }
    }

    /// Cancels an armed awaiter.
    ///
    /// Returns `true` if it was still queued (and is now removed);
    /// `false` if it already fired or is firing (in which case this
    /// waits for the handler to finish before returning).
    pub fn unset_alarm(&self, awaiter: &Arc<Awaiter>) -> bool {
        {
            let mut st = self.state.lock();
            if awaiter.on_tchain() {
                let was_head = st
                    .awaiters
                    .first()
                    .is_some_and(|a| Arc::ptr_eq(a, awaiter));
                st.awaiters.retain(|a| !Arc::ptr_eq(a, awaiter));
                awaiter.on_tchain.store(false, Ordering::Release);
                if was_head {
                    let next = st.awaiters.first().map_or(0, |a| a.wake_up_time());
                    self.reprogram(&mut st, next);
                }
                return true;
            }
        }
        // Not queued: either done, or its handler is running right now.
        while awaiter.firing.load(Ordering::Acquire) {
            cpu_relax_vc();
        }
        false
    }

    /// Atomically moves an awaiter to a new deadline.
    pub fn reset_alarm(&self, awaiter: &Arc<Awaiter>, wake_up_time: u64) {
        self.unset_alarm(awaiter);
        self.set_alarm(awaiter, wake_up_time);
    }

    /// The `EV_ALARM` handler: fires every expired awaiter, then aims
    /// the device at the new head (or disarms it).
    fn trigger(&self) {
        loop {
            let expired = {
                let mut st = self.state.lock();
                let now = read_tsc();
                let head_time = st.awaiters.first().map(|a| a.wake_up_time());
                match head_time {
                    Some(t) if t <= now => {
                        let head = st.awaiters.remove(0);
                        head.on_tchain.store(false, Ordering::Release);
                        head.firing.store(true, Ordering::Release);
                        Some(head)
                    }
                    Some(t) => {
                        self.reprogram(&mut st, t);
                        None
                    }
                    None => {
                        self.reprogram(&mut st, 0);
                        None
                    }
                }
            };
            let Some(awaiter) = expired else { return };
            // Handlers run one at a time, outside the chain lock.
            (awaiter.handler.clone())(&awaiter);
            awaiter.firing.store(false, Ordering::Release);
        }
    }

    /// Points the backing device alarm at `deadline` (0 disarms),
    /// skipping redundant writes.
    fn reprogram(&self, st: &mut ChainState, deadline: u64) {
        if st.programmed == deadline {
            return;
        }
        st.programmed = deadline;
        let Some(rt) = self.rt.upgrade() else { return };
        if devalarm_timer_write(&rt, self.alarm_id, deadline).is_err() {
            log::warn!("timer chain: device reprogram failed");
        }
    }
}
