//! A full queue-based second-level scheduler.
//!
//! What a real multithreaded program links instead of thread0: a ready
//! queue guarded by a preemption-aware lock, spawn/join/exit, and
//! parking synchronization primitives (mutex, condition variable,
//! sense-reversing barrier). Blocked syscalls park their uthread in a
//! completion map keyed by syscall identity; the completion event
//! requeues it.

pub mod sync;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, OnceLock, Weak};

use corral_abi::event::EV_SYSCALL;
use corral_abi::{EventQueue, EvqFlags, Syscall};
use corral_kernel::Machine;
use corral_kernel::sysc_addr;
use corral_user::UserRuntime;
use corral_user::spinlock::SpinPdr;
use corral_user::uthread::{
    SchedDecision, SchedOps, Uthread, change_to_mcp, uthread_create, uthread_yield,
};

pub use sync::{Barrier, CondVar, Mutex};

/// Join bookkeeping for one spawned thread.
enum JoinState {
    Running,
    Waited(Arc<Uthread>),
    Done,
}

/// The queue-based 2LS.
pub struct Scheduler {
    rt: OnceLock<Weak<UserRuntime>>,
    ready: SpinPdr<VecDeque<Arc<Uthread>>>,
    sysc_evq: OnceLock<Arc<EventQueue>>,
    /// Uthreads parked on in-flight syscalls, keyed by syscall identity.
    blocked_syscs: SpinPdr<BTreeMap<u64, Arc<Uthread>>>,
    joins: SpinPdr<BTreeMap<u64, JoinState>>,
    /// Cores this program wants while it has runnable work.
    nr_vcores_wanted: u32,
}

impl Scheduler {
    fn new(nr_vcores_wanted: u32) -> Self {
        Self {
            rt: OnceLock::new(),
            ready: SpinPdr::new(VecDeque::new()),
            sysc_evq: OnceLock::new(),
            blocked_syscs: SpinPdr::new(BTreeMap::new()),
            joins: SpinPdr::new(BTreeMap::new()),
            nr_vcores_wanted,
        }
    }

    fn runtime(&self) -> Arc<UserRuntime> {
        self.rt
            .get()
            .and_then(Weak::upgrade)
            .expect("scheduler used before init")
    }

    /// Queue a uthread at the tail of the ready queue.
    pub(crate) fn enqueue(&self, uth: &Arc<Uthread>) {
        self.ready.lock().push_back(uth.clone());
    }
}

impl SchedOps for Scheduler {
    fn sched_entry(&self, rt: &Arc<UserRuntime>, _vcoreid: u32) -> SchedDecision {
        if let Some(uth) = self.ready.lock().pop_front() {
            return SchedDecision::Run(uth);
        }
        // Nothing to run here: shed this core. Completion events carry
        // WAKEUP, so a fully idle process comes back when work arrives.
        let pi = rt.proc().procinfo();
        let online = pi.num_vcores();
        rt.proc()
            .procdata()
            .set_res_desire(corral_abi::RES_CORES, online.saturating_sub(1));
        SchedDecision::Idle
    }

    fn thread_runnable(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>) {
        self.enqueue(uth);
        // More work: ask for cores back up to our ceiling.
        let pd = rt.proc().procdata();
        let cur = pd.res_desire(corral_abi::RES_CORES);
        let online = rt.proc().procinfo().num_vcores();
        let want = (online + 1).clamp(cur.max(1), self.nr_vcores_wanted);
        if want != cur {
            pd.set_res_desire(corral_abi::RES_CORES, want);
            rt.machine().run_scheduler();
        }
    }

    fn thread_paused(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>) {
        // Recovered from a preempted vcore; run it again soon.
        self.thread_runnable(rt, uth);
    }

    fn thread_has_blocked(&self, _rt: &Arc<UserRuntime>, _uth: &Arc<Uthread>) {
        // The blocker already parked it wherever it blocks.
    }

    fn thread_blockon_sysc(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>, sysc: &Arc<Syscall>) {
        let addr = sysc_addr(sysc);
        self.blocked_syscs.lock().insert(addr, uth.clone());
        let evq = self.sysc_evq.get().expect("scheduler ev_q missing");
        if !sysc.register_evq(evq.id()) {
            // Completed before we could sleep.
            if let Some(uth) = self.blocked_syscs.lock().remove(&addr) {
                self.thread_runnable(rt, &uth);
            }
        }
    }

    fn thread_refl_fault(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>, fault: &str) {
        log::error!(
            "pid {}: uthread {} fault: {fault}",
            rt.proc().pid(),
            uth.id()
        );
        rt.exit(-1);
    }
}

/// Handle for joining a spawned thread.
pub struct JoinHandle {
    sched: Arc<Scheduler>,
    id: u64,
}

impl JoinHandle {
    /// Blocks the calling uthread until the thread exits.
    pub fn join(self) {
        loop {
            {
                let mut joins = self.sched.joins.lock();
                let done = match joins.get(&self.id) {
                    Some(JoinState::Done) | None => true,
                    Some(JoinState::Waited(_)) => panic!("thread joined twice"),
                    Some(JoinState::Running) => false,
                };
                if done {
                    joins.remove(&self.id);
                    return;
                }
            }
            let sched = self.sched.clone();
            let id = self.id;
            uthread_yield(true, move |uth| {
                let parked = {
                    let mut joins = sched.joins.lock();
                    let running = matches!(joins.get(&id), Some(JoinState::Running));
                    if running {
                        joins.insert(id, JoinState::Waited(uth.clone()));
                    }
                    running
                };
                if !parked {
                    // Exited between our check and the park.
                    let rt = sched.runtime();
                    sched.thread_runnable(&rt, uth);
                }
            });
        }
    }
}

/// Spawns a uthread under this scheduler.
pub fn spawn(sched: &Arc<Scheduler>, f: impl FnOnce() + Send + 'static) -> JoinHandle {
    let rt = sched.runtime();
    let sched2 = sched.clone();
    let uth = uthread_create(&rt, move || {
        f();
        thread_exit(&sched2);
    });
    sched.joins.lock().insert(uth.id(), JoinState::Running);
    sched.thread_runnable(&rt, &uth);
    JoinHandle {
        sched: sched.clone(),
        id: uth.id(),
    }
}

/// Exits the calling uthread, waking its joiner. Does not return.
fn thread_exit(sched: &Arc<Scheduler>) -> ! {
    let sched = sched.clone();
    uthread_yield(false, move |uth| {
        let waiter = {
            let mut joins = sched.joins.lock();
            match joins.insert(uth.id(), JoinState::Done) {
                Some(JoinState::Waited(w)) => Some(w),
                _ => None,
            }
        };
        if let Some(w) = waiter {
            let rt = sched.runtime();
            sched.thread_runnable(&rt, &w);
        }
    });
    unreachable!("uthread_yield without save returned");
}

/// Boots a process under this scheduler: starts as an SCP, flips to an
/// MCP with `nr_vcores` cores, then runs `main` as the first uthread.
pub fn spawn_mcp(
    machine: &Machine,
    nr_vcores: u32,
    main: impl FnOnce(Arc<Scheduler>) + Send + 'static,
) -> (Arc<Scheduler>, Arc<UserRuntime>) {
    let sched = Arc::new(Scheduler::new(nr_vcores));
    let ops: Arc<dyn SchedOps> = sched.clone();
    let rt = UserRuntime::create(machine, ops);
    sched.rt.set(Arc::downgrade(&rt)).ok().expect("spawn_mcp once");

    let evq = rt.get_eventq_vcpd(
        0,
        EvqFlags::IPI | EvqFlags::FALLBACK | EvqFlags::SPAM_PUBLIC | EvqFlags::WAKEUP,
    );
    sched
        .sysc_evq
        .set(evq)
        .ok()
        .expect("spawn_mcp called twice");
    {
        let sched2 = sched.clone();
        rt.register_ev_handler(
            EV_SYSCALL,
            Arc::new(move |rt, msg, _t| {
                let addr = msg.ev_arg3;
                let woken = sched2.blocked_syscs.lock().remove(&addr);
                if let Some(uth) = woken {
                    sched2.thread_runnable(rt, &uth);
                }
            }),
        );
    }

    let sched_main = sched.clone();
    let rt2 = rt.clone();
    let uth = uthread_create(&rt, move || {
        change_to_mcp(&rt2, nr_vcores).expect("change_to_m failed");
        main(sched_main.clone());
        thread_exit(&sched_main);
    });
    sched.joins.lock().insert(uth.id(), JoinState::Running);
    sched.enqueue(&uth);
    rt.start();
    (sched, rt)
}
