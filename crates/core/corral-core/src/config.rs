//! Build-time tunables.
//!
//! Sizing constants shared by the kernel model and the user runtime.
//! All of these are part of the shared-memory contract: changing one
//! changes struct layouts on both sides at once.

/// Maximum vcores a single process may ever hold. Sizes the vcoremap and
/// the per-vcore preempt-data array.
pub const MAX_VCORES: usize = 32;

/// Maximum physical cores the machine model supports.
pub const MAX_PCORES: usize = 64;

/// Number of distinct event types. Sizes bitmap mailboxes and the CEQ
/// event array default.
pub const NR_EVENT_TYPES: usize = 64;

/// Byte size of one UCQ page.
pub const UCQ_PAGE_SIZE: usize = 4096;

/// Number of extra UCQ pages a single mailbox may accumulate before the
/// producer starts logging warnings. Unbounded growth usually means the
/// consumer is wedged.
pub const UCQ_WARN_THRESH: usize = 1000;

/// Default CEQ index-ring size. Must be a power of two.
pub const CEQ_DEFAULT_RING_SZ: u32 = 512;

/// Spins a barrier waiter burns before parking its uthread.
pub const BARRIER_SPINS: usize = 1000;

/// Spins between preemption-word polls in long busy-wait loops.
pub const POLL_SPIN_INTERVAL: usize = 64;
