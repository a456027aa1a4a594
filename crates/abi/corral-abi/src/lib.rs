//! Shared kernel/user contract.
//!
//! Everything both sides of the runtime must agree on: event numbering
//! and queue descriptors, the asynchronous syscall struct and its
//! completion flags, saved user contexts, and the two per-process shared
//! regions (`procinfo` read-only to user code, `procdata` read-write).
//! Nothing here does scheduling; this crate is the wire format the
//! kernel model and the user runtime speak through shared memory.

pub mod ctx;
pub mod event;
pub mod procdata;
pub mod procinfo;
pub mod syscall;

pub use ctx::{CtxKind, UserContext};
pub use event::{EventQueue, EvqFlags, EvqId};
pub use syscall::{Errno, Syscall, SyscallFlags};

/// Number of resource classes a process can hold grants for.
pub const NR_RES: usize = 1;

/// The cores resource class (the only one the allocator manages).
pub const RES_CORES: usize = 0;
