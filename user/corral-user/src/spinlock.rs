//! Preemption-aware spinlocks.
//!
//! A plain spinlock deadlocks the moment its holder's vcore is revoked:
//! the waiters spin on a core the holder will never get back. The PDR
//! (preemption detection and recovery) discipline fixes that by telling
//! the waiter who holds the lock, so the waiter can hand its own pcore
//! to the preempted holder and spin again once restarted.
//!
//! Two variants, as the lock word allows: [`SpinPdr`] stores the
//! holder's vcoreid in the lock word itself (CAS discipline, preferred);
//! [`SpinPdrNoCas`] is a test-and-set lock with the holder advertised
//! beside it, falling back to "make every vcore run" in the windows
//! where no holder is visible yet.
//!
//! Both disable notifications for uthread-context callers around the
//! critical section, so preemption handlers know not to migrate them.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use corral_core::atomic::{cmb, wmb};

use crate::uthread::{uth_disable_notifs, uth_enable_notifs};
use crate::vcore::{cpu_relax_vc, ensure_all_vcores_run, ensure_vcore_runs, try_vcore_id};

const SPINPDR_UNLOCKED: u32 = u32::MAX;
const VCOREID_UNKNOWN: u32 = u32::MAX;
/// Holder id recorded by setup code running outside process context (a
/// plain host thread cannot be preempted, so spinners just wait).
const VCOREID_OUTSIDE: u32 = u32::MAX - 1;

fn my_lock_id() -> u32 {
    try_vcore_id().unwrap_or(VCOREID_OUTSIDE)
}

/// CAS-discipline PDR spinlock: the lock word is either unlocked or the
/// holder's vcoreid.
pub struct SpinPdr<T> {
    lock: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the lock word serializes access to `data`.
unsafe impl<T: Send> Send for SpinPdr<T> {}
unsafe impl<T: Send> Sync for SpinPdr<T> {}

impl<T> SpinPdr<T> {
    /// Creates an unlocked lock.
    pub const fn new(value: T) -> Self {
        Self {
            lock: AtomicU32::new(SPINPDR_UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires, boosting a preempted holder while spinning.
    pub fn lock(&self) -> SpinPdrGuard<'_, T> {
        uth_disable_notifs();
        let my_vcoreid = my_lock_id();
        loop {
            let lock_val = self.lock.load(Ordering::Acquire);
            if lock_val == SPINPDR_UNLOCKED {
                if self
                    .lock
                    .compare_exchange_weak(
                        SPINPDR_UNLOCKED,
                        my_vcoreid,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    cmb();
                    return SpinPdrGuard { lock: self };
                }
                continue;
            }
            ensure_vcore_runs(lock_val);
            cpu_relax_vc();
        }
    }

    /// Single acquisition attempt.
    pub fn try_lock(&self) -> Option<SpinPdrGuard<'_, T>> {
        uth_disable_notifs();
        let my_vcoreid = my_lock_id();
        if self
            .lock
            .compare_exchange(
                SPINPDR_UNLOCKED,
                my_vcoreid,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(SpinPdrGuard { lock: self })
        } else {
            uth_enable_notifs();
            None
        }
    }

    /// Whether the lock is held.
    pub fn locked(&self) -> bool {
        self.lock.load(Ordering::Acquire) != SPINPDR_UNLOCKED
    }
}

/// RAII guard for [`SpinPdr`].
pub struct SpinPdrGuard<'a, T> {
    lock: &'a SpinPdr<T>,
}

impl<T> Deref for SpinPdrGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinPdrGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinPdrGuard<'_, T> {
    fn drop(&mut self) {
        wmb();
        self.lock.lock.store(SPINPDR_UNLOCKED, Ordering::Release);
        uth_enable_notifs();
    }
}

/// Test-and-set PDR spinlock with an advertised lockholder.
///
/// There are two windows where the lock is held but no holder is
/// advertised yet; waiters that hit them make every vcore run. A
/// scalability hazard, kept as the fallback discipline.
pub struct SpinPdrNoCas<T> {
    locked: AtomicBool,
    lockholder: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the test-and-set bit serializes access to `data`.
unsafe impl<T: Send> Send for SpinPdrNoCas<T> {}
unsafe impl<T: Send> Sync for SpinPdrNoCas<T> {}

impl<T> SpinPdrNoCas<T> {
    /// Creates an unlocked lock.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            lockholder: AtomicU32::new(VCOREID_UNKNOWN),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires, boosting the advertised holder (or everyone) while
    /// spinning.
    pub fn lock(&self) -> SpinPdrNoCasGuard<'_, T> {
        uth_disable_notifs();
        while self.locked.swap(true, Ordering::AcqRel) {
            let holder = self.lockholder.load(Ordering::Acquire);
            if holder == VCOREID_UNKNOWN {
                ensure_all_vcores_run();
            } else {
                ensure_vcore_runs(holder);
            }
            cpu_relax_vc();
        }
        self.lockholder.store(my_lock_id(), Ordering::Release);
        SpinPdrNoCasGuard { lock: self }
    }

    /// Whether the lock is held.
    pub fn locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

/// RAII guard for [`SpinPdrNoCas`].
pub struct SpinPdrNoCasGuard<'a, T> {
    lock: &'a SpinPdrNoCas<T>,
}

impl<T> Deref for SpinPdrNoCasGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinPdrNoCasGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinPdrNoCasGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lockholder.store(VCOREID_UNKNOWN, Ordering::Release);
        self.lock.locked.store(false, Ordering::Release);
        uth_enable_notifs();
    }
}
