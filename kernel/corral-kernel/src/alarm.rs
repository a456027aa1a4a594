//! The kernel alarm device.
//!
//! A cloning device: each clone is an alarm with a `ctl`/`timer`/
//! `evq_ctl` trio. Writing a decimal absolute-TSC deadline to `timer`
//! arms it; writing an encoded ev_q id to `evq_ctl` binds completion
//! delivery; reading `ctl` returns the alarm id; closing disarms.
//!
//! One device thread owns a deadline min-heap and also serves the
//! kernel's own timed work: syscall timeouts (`sys_block`) and preempt
//! deadlines. Cancellation is generation-based: re-arming or closing an
//! alarm bumps its generation, and a popped heap entry whose generation
//! is stale fires nothing.

use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use corral_abi::EvqId;
use corral_abi::event::{EV_ALARM, EventMsg};
use corral_core::time::read_tsc;

use crate::{Machine, MachineInner};

/// What to do when a deadline passes.
pub(crate) enum AlarmAction {
    /// Fire a user alarm clone (post `EV_ALARM` to its bound ev_q).
    User { alarm_id: u32, generation: u64 },
    /// Complete a pending `sys_block`.
    SyscTimeout { addr: u64 },
    /// Enforce a posted revocation warning.
    PreemptDeadline { pcoreid: u32 },
}

/// One user alarm clone.
struct AlarmEntry {
    pid: u32,
    evq: Option<EvqId>,
    generation: u64,
}

struct AlarmState {
    /// Min-heap of (deadline, seq); the action lives in `actions`.
    heap: BinaryHeap<std::cmp::Reverse<(u64, u64)>>,
    actions: BTreeMap<u64, AlarmAction>,
    next_seq: u64,
    alarms: BTreeMap<u32, AlarmEntry>,
    next_alarm_id: u32,
    shutdown: bool,
}

/// The device: shared state plus the timer thread.
pub(crate) struct AlarmDev {
    state: Mutex<AlarmState>,
    cv: Condvar,
    thread: corral_core::SpinLock<Option<std::thread::JoinHandle<()>>>,
}

impl AlarmDev {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(AlarmState {
                heap: BinaryHeap::new(),
                actions: BTreeMap::new(),
                next_seq: 0,
                alarms: BTreeMap::new(),
                next_alarm_id: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            thread: corral_core::SpinLock::new(None),
        }
    }

    /// Spawns the device thread.
    pub(crate) fn start(this: &Arc<Self>, machine: Weak<MachineInner>) {
        let dev = this.clone();
        let handle = std::thread::Builder::new()
            .name("devalarm".into())
            .spawn(move || dev.run(&machine))
            .expect("failed to spawn alarm device thread");
        *this.thread.lock() = Some(handle);
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.cv.notify_all();
        if let Some(h) = self.thread.lock().take() {
            let _ = h.join();
        }
    }

    /// Queues an action at an absolute TSC deadline.
    pub(crate) fn arm(&self, deadline_tsc: u64, action: AlarmAction) {
        let mut st = self.state.lock().unwrap();
        let seq = st.next_seq;
        st.next_seq += 1;
        st.heap.push(std::cmp::Reverse((deadline_tsc, seq)));
        st.actions.insert(seq, action);
        self.cv.notify_all();
    }

    // ── Devalarm file surface ────────────────────────────────────────

    /// `clone`: creates an alarm owned by `pid`; returns its id.
    pub(crate) fn clone_alarm(&self, pid: u32) -> u32 {
        let mut st = self.state.lock().unwrap();
        let id = st.next_alarm_id;
        st.next_alarm_id += 1;
        st.alarms.insert(
            id,
            AlarmEntry {
                pid,
                evq: None,
                generation: 0,
            },
        );
        id
    }

    /// Reading `ctl` returns the alarm id, decimal.
    pub(crate) fn ctl_read(&self, alarm_id: u32) -> Option<String> {
        let st = self.state.lock().unwrap();
        st.alarms.get(&alarm_id).map(|_| alarm_id.to_string())
    }

    /// Writing a decimal absolute TSC value to `timer` (re)arms the
    /// alarm; writing `0` disarms it.
    pub(crate) fn timer_write(&self, alarm_id: u32, text: &str) -> Result<(), ()> {
        let deadline: u64 = text.trim().parse().map_err(|_| ())?;
        let mut st = self.state.lock().unwrap();
        let entry = st.alarms.get_mut(&alarm_id).ok_or(())?;
        entry.generation += 1;
        let generation = entry.generation;
        if deadline == 0 {
            return Ok(());
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        st.heap.push(std::cmp::Reverse((deadline, seq)));
        st.actions
            .insert(seq, AlarmAction::User { alarm_id, generation });
        self.cv.notify_all();
        Ok(())
    }

    /// Writing an encoded ev_q id to `evq_ctl` binds delivery.
    pub(crate) fn evqctl_write(&self, alarm_id: u32, text: &str) -> Result<(), ()> {
        let word: u64 = text.trim().parse().map_err(|_| ())?;
        let mut st = self.state.lock().unwrap();
        let entry = st.alarms.get_mut(&alarm_id).ok_or(())?;
        entry.evq = EvqId::decode(word);
        Ok(())
    }

    /// Closing the trio disarms and releases the alarm.
    pub(crate) fn close_alarm(&self, alarm_id: u32) {
        self.state.lock().unwrap().alarms.remove(&alarm_id);
    }

    /// Drops every alarm owned by a dying process.
    pub(crate) fn cancel_proc(&self, pid: u32) {
        self.state.lock().unwrap().alarms.retain(|_, e| e.pid != pid);
    }

    // ── Device thread ────────────────────────────────────────────────

    fn run(&self, machine: &Weak<MachineInner>) {
        loop {
            let mut st = self.state.lock().unwrap();
            if st.shutdown {
                return;
            }
            let now = read_tsc();
            match st.heap.peek().copied() {
                Some(std::cmp::Reverse((deadline, seq))) if deadline <= now => {
                    st.heap.pop();
                    let action = st.actions.remove(&seq);
                    // Resolve user-alarm liveness under the lock, fire
                    // outside it.
                    let fire = action.and_then(|a| self.resolve(&st, a));
                    drop(st);
                    if let Some(fire) = fire {
                        let Some(inner) = machine.upgrade() else {
                            return;
                        };
                        fire_action(&Machine::from_inner(inner), fire);
                    }
                }
                Some(std::cmp::Reverse((deadline, _))) => {
                    let dur = Duration::from_nanos(deadline - now);
                    let (g, _timeout) = self.cv.wait_timeout(st, dur).unwrap();
                    drop(g);
                }
                None => {
                    let g = self.cv.wait(st).unwrap();
                    drop(g);
                }
            }
        }
    }

    /// Filters stale generations and resolves user alarms to their
    /// delivery target.
    fn resolve(&self, st: &AlarmState, action: AlarmAction) -> Option<ResolvedFire> {
        match action {
            AlarmAction::User { alarm_id, generation } => {
                let entry = st.alarms.get(&alarm_id)?;
                if entry.generation != generation {
                    return None;
                }
                let evq = entry.evq?;
                Some(ResolvedFire::UserAlarm {
                    pid: entry.pid,
                    alarm_id,
                    evq,
                })
            }
            AlarmAction::SyscTimeout { addr } => Some(ResolvedFire::SyscTimeout { addr }),
            AlarmAction::PreemptDeadline { pcoreid } => {
                Some(ResolvedFire::PreemptDeadline { pcoreid })
            }
        }
    }
}

/// An action that survived staleness filtering.
enum ResolvedFire {
    UserAlarm { pid: u32, alarm_id: u32, evq: EvqId },
    SyscTimeout { addr: u64 },
    PreemptDeadline { pcoreid: u32 },
}

fn fire_action(machine: &Machine, fire: ResolvedFire) {
    match fire {
        ResolvedFire::UserAlarm { pid, alarm_id, evq } => {
            let Some(proc) = machine.lookup_proc(pid) else {
                return;
            };
            log::trace!("devalarm: alarm {alarm_id} fires for pid {pid}");
            let msg = EventMsg {
                ev_type: EV_ALARM,
                ev_arg1: 0,
                ev_arg2: alarm_id,
                ev_arg3: 0,
                ev_arg4: 0,
            };
            machine.send_event(&proc, evq, &msg);
        }
        ResolvedFire::SyscTimeout { addr } => {
            machine.complete_block_timeout(addr);
        }
        ResolvedFire::PreemptDeadline { pcoreid } => {
            machine.enforce_preempt_deadline(pcoreid);
        }
    }
}
