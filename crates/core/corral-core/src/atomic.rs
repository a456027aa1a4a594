//! Atomic helpers and memory barriers.
//!
//! Thin wrappers over [`core::sync::atomic`] providing the handful of
//! compound operations the allocator and event fabric rely on, plus the
//! traditional barrier vocabulary (`mb`/`rmb`/`wmb`/`wrmb`/`cmb`) so that
//! producer/consumer code can state its ordering requirements at the
//! call site instead of scattering raw fences.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering, compiler_fence, fence};

/// Full memory barrier: no loads or stores cross in either direction.
#[inline]
pub fn mb() {
    fence(Ordering::SeqCst);
}

/// Read barrier: earlier loads complete before later loads.
#[inline]
pub fn rmb() {
    fence(Ordering::Acquire);
}

/// Write barrier: earlier stores complete before later stores.
#[inline]
pub fn wmb() {
    fence(Ordering::Release);
}

/// Write-then-read barrier: earlier stores complete before later loads.
///
/// Store-load ordering is the one case release/acquire cannot express,
/// so this is a full fence.
#[inline]
pub fn wrmb() {
    fence(Ordering::SeqCst);
}

/// Compiler-only barrier. Stops the compiler from caching or reordering
/// memory accesses across this point without emitting a CPU fence.
#[inline]
pub fn cmb() {
    compiler_fence(Ordering::SeqCst);
}

/// Atomically increments `a` by `v` unless it is zero.
///
/// Returns `false` (leaving the counter untouched) if the counter was
/// zero at any attempt. This is the kref "get a reference only if one
/// already exists" primitive.
pub fn add_not_zero(a: &AtomicU32, v: u32) -> bool {
    let mut cur = a.load(Ordering::Relaxed);
    loop {
        if cur == 0 {
            return false;
        }
        match a.compare_exchange_weak(cur, cur + v, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(seen) => cur = seen,
        }
    }
}

/// Atomically subtracts `v` from `a`; returns `true` iff the result is zero.
///
/// The release/acquire pair makes the last decrement synchronize with
/// every earlier one, so the caller observing `true` may free the object.
pub fn sub_and_test(a: &AtomicU32, v: u32) -> bool {
    a.fetch_sub(v, Ordering::AcqRel) == v
}

/// Atomically swaps in `v`, returning the previous value.
#[inline]
pub fn swap_u64(a: &AtomicU64, v: u64) -> u64 {
    a.swap(v, Ordering::AcqRel)
}

/// Compare-and-swap on a `u32`; returns `true` on success.
#[inline]
pub fn cas_u32(a: &AtomicU32, old: u32, new: u32) -> bool {
    a.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Compare-and-swap on a `u64`; returns `true` on success.
#[inline]
pub fn cas_u64(a: &AtomicU64, old: u64, new: u64) -> bool {
    a.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Relaxed-spin hint for busy-wait loops.
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_not_zero_refuses_zero() {
        let a = AtomicU32::new(0);
        assert!(!add_not_zero(&a, 1));
        assert_eq!(a.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn add_not_zero_increments_nonzero() {
        let a = AtomicU32::new(3);
        assert!(add_not_zero(&a, 2));
        assert_eq!(a.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn sub_and_test_detects_last_drop() {
        let a = AtomicU32::new(2);
        assert!(!sub_and_test(&a, 1));
        assert!(sub_and_test(&a, 1));
    }

    #[test]
    fn cas_u32_success_and_failure() {
        let a = AtomicU32::new(7);
        assert!(cas_u32(&a, 7, 9));
        assert!(!cas_u32(&a, 7, 11));
        assert_eq!(a.load(Ordering::Relaxed), 9);
    }
}
