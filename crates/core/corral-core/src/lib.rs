//! Foundation crate for the corral runtime.
//!
//! Pure-logic building blocks shared by the kernel model and the user-mode
//! scheduling substrate: atomic helpers and memory barriers, a coalescing
//! poke tracker, a TTAS spinlock, a sequence counter for torn-read-free
//! snapshots of shared maps, a TSC-style monotonic clock, and the tunable
//! constants everything else sizes itself against.

pub mod atomic;
pub mod config;
pub mod handoff;
pub mod poke;
pub mod seq;
pub mod spinlock;
pub mod time;

pub use handoff::Handoff;
pub use poke::PokeTracker;
pub use seq::SeqCounter;
pub use spinlock::{SpinLock, SpinLockGuard};
