//! Parking synchronization primitives.
//!
//! All three park uthreads on per-object queues guarded by a
//! preemption-aware lock. Parking is race-free because the enqueue
//! happens in the yield callback, which runs in vcore context after the
//! uthread's state is saved: a waker never sees a waiter that is not
//! yet resumable, and a wake that slips in between the fast-path check
//! and the park is detected inside the callback.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use corral_core::config::BARRIER_SPINS;
use corral_user::spinlock::SpinPdr;
use corral_user::uthread::{Uthread, uthread_yield};
use corral_user::vcore::{cpu_relax_vc, current_runtime};

use crate::Scheduler;

fn wake(sched: &Arc<Scheduler>, uth: &Arc<Uthread>) {
    let rt = current_runtime().expect("wake outside process context");
    use corral_user::uthread::SchedOps as _;
    sched.thread_runnable(&rt, uth);
}

// ── Mutex ────────────────────────────────────────────────────────────

struct MutexState {
    locked: bool,
    waiters: VecDeque<Arc<Uthread>>,
}

/// A sleeping mutual-exclusion lock for uthreads.
pub struct Mutex {
    self_ref: Weak<Mutex>,
    sched: Arc<Scheduler>,
    state: SpinPdr<MutexState>,
}

impl Mutex {
    /// Creates an unlocked mutex under `sched`.
    pub fn new(sched: &Arc<Scheduler>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            self_ref: weak.clone(),
            sched: sched.clone(),
            state: SpinPdr::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            }),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("mutex freed while in use")
    }

    /// Acquires, parking the calling uthread while contended.
    pub fn lock(&self) {
        loop {
            {
                let mut st = self.state.lock();
                if !st.locked {
                    st.locked = true;
                    return;
                }
            }
            let this = self.arc();
            uthread_yield(true, move |uth| {
                let mut st = this.state.lock();
                if st.locked {
                    st.waiters.push_back(uth.clone());
                } else {
                    // Released between our check and the park: rerun.
                    drop(st);
                    wake(&this.sched, uth);
                }
            });
            // Retry the acquisition (Mesa-style handoff).
        }
    }

    /// Single acquisition attempt.
    pub fn try_lock(&self) -> bool {
        let mut st = self.state.lock();
        if st.locked {
            false
        } else {
            st.locked = true;
            true
        }
    }

    /// Releases, waking one waiter.
    pub fn unlock(&self) {
        let woken = {
            let mut st = self.state.lock();
            assert!(st.locked, "unlock of an unlocked mutex");
            st.locked = false;
            st.waiters.pop_front()
        };
        if let Some(uth) = woken {
            wake(&self.sched, &uth);
        }
    }

    /// Runs `f` with the mutex held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }
}

// ── Condition variable ───────────────────────────────────────────────

/// A condition variable paired with a [`Mutex`] at each wait.
pub struct CondVar {
    self_ref: Weak<CondVar>,
    sched: Arc<Scheduler>,
    waiters: SpinPdr<VecDeque<Arc<Uthread>>>,
}

impl CondVar {
    /// Creates an empty condition variable under `sched`.
    pub fn new(sched: &Arc<Scheduler>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            self_ref: weak.clone(),
            sched: sched.clone(),
            waiters: SpinPdr::new(VecDeque::new()),
        })
    }

    /// Atomically releases `mutex` and parks; re-acquires before
    /// returning. Wakeups are Mesa-style: re-check the predicate.
    pub fn wait(&self, mutex: &Arc<Mutex>) {
        let this = self.self_ref.upgrade().expect("condvar freed while in use");
        let mutex2 = mutex.clone();
        uthread_yield(true, move |uth| {
            // Enqueue first, then release: a signaller acquiring the
            // mutex after us is guaranteed to see us in the queue.
            this.waiters.lock().push_back(uth.clone());
            mutex2.unlock();
        });
        mutex.lock();
    }

    /// Wakes one waiter.
    pub fn signal(&self) {
        let woken = self.waiters.lock().pop_front();
        if let Some(uth) = woken {
            wake(&self.sched, &uth);
        }
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        let drained: Vec<_> = {
            let mut w = self.waiters.lock();
            w.drain(..).collect()
        };
        for uth in drained {
            wake(&self.sched, &uth);
        }
    }
}

// ── Barrier ──────────────────────────────────────────────────────────

struct BarrierState {
    count: usize,
    sense: bool,
    parked: Vec<Arc<Uthread>>,
}

/// Sense-reversing barrier: arrivals spin briefly on the flipped sense,
/// then park.
pub struct Barrier {
    self_ref: Weak<Barrier>,
    sched: Arc<Scheduler>,
    total: usize,
    state: SpinPdr<BarrierState>,
}

impl Barrier {
    /// Creates a barrier for `total` participants.
    pub fn new(sched: &Arc<Scheduler>, total: usize) -> Arc<Self> {
        assert!(total > 0);
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            self_ref: weak.clone(),
            sched: sched.clone(),
            total,
            state: SpinPdr::new(BarrierState {
                count: 0,
                sense: false,
                parked: Vec::new(),
            }),
        })
    }

    fn sense(&self) -> bool {
        self.state.lock().sense
    }

    /// Waits until all `total` participants arrive.
    pub fn wait(&self) {
        let local_sense = {
            let mut st = self.state.lock();
            let local_sense = !st.sense;
            st.count += 1;
            if st.count == self.total {
                // Last arrival: reset and release everyone.
                st.count = 0;
                st.sense = local_sense;
                let parked = std::mem::take(&mut st.parked);
                drop(st);
                for uth in parked {
                    wake(&self.sched, &uth);
                }
                return;
            }
            local_sense
        };
        // Spin a little before paying for a park.
        for _ in 0..BARRIER_SPINS {
            if self.sense() == local_sense {
                return;
            }
            cpu_relax_vc();
        }
        let this = self.self_ref.upgrade().expect("barrier freed while in use");
        uthread_yield(true, move |uth| {
            let mut st = this.state.lock();
            if st.sense == local_sense {
                // Released while we were arranging the park.
                drop(st);
                wake(&this.sched, uth);
            } else {
                st.parked.push(uth.clone());
            }
        });
        debug_assert_eq!(self.sense(), local_sense, "woken before release");
    }
}
