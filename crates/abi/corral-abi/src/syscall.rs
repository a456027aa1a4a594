//! The asynchronous syscall contract.
//!
//! A syscall is a little shared-memory state machine: the caller fills
//! `num`/`args` and submits; the kernel either completes synchronously
//! (`SC_DONE` set before submission returns) or finishes later and
//! signals through the event fabric. The completion/registration race is
//! decided by a single atomic flags word: both sides RMW it, so exactly
//! one of them observes the other.

use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use corral_core::SpinLock;
use corral_core::atomic::{wmb, wrmb};

use crate::event::EvqId;

bitflags::bitflags! {
    /// Syscall state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyscallFlags: u32 {
        /// The kernel finished this syscall; retval/err are valid.
        const SC_DONE = 1 << 0;
        /// The syscall made progress but did not complete (hint).
        const SC_PROGRESS = 1 << 1;
        /// User-mode registered an ev_q for completion notification.
        const SC_UEVENT = 1 << 2;
        /// User-mode asked the kernel to cancel the syscall.
        const SC_ABORT = 1 << 3;
        /// Kernel-internal lock bit for completion-site exclusion.
        const SC_K_LOCK = 1 << 4;
    }
}

/// Errno-style error codes surfaced through `Syscall::err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Errno {
    /// No such file or object.
    ENOENT = 2,
    /// No such process.
    ESRCH = 3,
    /// Interrupted (aborted) syscall.
    EINTR = 4,
    /// Try again; transient shortage.
    EAGAIN = 11,
    /// Out of memory.
    ENOMEM = 12,
    /// Resource busy.
    EBUSY = 16,
    /// Invalid argument.
    EINVAL = 22,
    /// Unknown syscall number.
    ENOSYS = 38,
    /// Timed out.
    ETIMEDOUT = 110,
}

impl Errno {
    /// Decodes a stored error word.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            2 => Some(Self::ENOENT),
            3 => Some(Self::ESRCH),
            4 => Some(Self::EINTR),
            11 => Some(Self::EAGAIN),
            12 => Some(Self::ENOMEM),
            16 => Some(Self::EBUSY),
            22 => Some(Self::EINVAL),
            38 => Some(Self::ENOSYS),
            110 => Some(Self::ETIMEDOUT),
            _ => None,
        }
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::ENOENT => "no such object",
            Self::ESRCH => "no such process",
            Self::EINTR => "interrupted",
            Self::EAGAIN => "try again",
            Self::ENOMEM => "out of memory",
            Self::EBUSY => "busy",
            Self::EINVAL => "invalid argument",
            Self::ENOSYS => "unknown syscall",
            Self::ETIMEDOUT => "timed out",
        };
        write!(f, "{name}")
    }
}

/// Syscall numbers (fixed ABI).
pub mod nr {
    /// Create a process from a program image.
    pub const PROC_CREATE: u32 = 1;
    /// Start a created process (as an SCP).
    pub const PROC_RUN: u32 = 2;
    /// Destroy a process.
    pub const PROC_DESTROY: u32 = 3;
    /// Yield the calling vcore's pcore (arg0: being_nice).
    pub const PROC_YIELD: u32 = 4;
    /// Hand the calling vcore's pcore to another vcore.
    pub const CHANGE_VCORE: u32 = 5;
    /// Become an MCP with arg0 vcores.
    pub const CHANGE_TO_M: u32 = 6;
    /// Provision a pcore to a process.
    pub const PROVISION: u32 = 7;
    /// Ask which vcore the caller runs as.
    pub const GET_VCOREID: u32 = 8;
    /// Post an event message to one of the caller's own vcores.
    pub const SELF_NOTIFY: u32 = 9;
    /// Post an event message to another process.
    pub const NOTIFY: u32 = 10;
    /// Sleep for arg0 microseconds (slow; completes via ev_q).
    pub const BLOCK: u32 = 11;
    /// Read bytes from a kernel byte-channel (slow when empty).
    pub const CHAN_READ: u32 = 12;
    /// Write bytes to a kernel byte-channel.
    pub const CHAN_WRITE: u32 = 13;
    /// Cancel a pending syscall (arg0: syscall reference).
    pub const ABORT_SYSC: u32 = 14;
    /// Poke the scheduler about changed desires.
    pub const POKE_KSCHED: u32 = 15;
    /// Clone an alarm from the alarm device; returns the alarm id.
    pub const ALARM_CLONE: u32 = 16;
    /// Read an alarm's ctl file (returns the alarm id).
    pub const ALARM_CTL_READ: u32 = 17;
    /// Write a decimal absolute-TSC deadline to an alarm's timer file.
    pub const ALARM_TIMER_WRITE: u32 = 18;
    /// Bind an ev_q to an alarm via its evq_ctl file.
    pub const ALARM_EVQCTL_WRITE: u32 = 19;
    /// Close (disarm and release) an alarm.
    pub const ALARM_CLOSE: u32 = 20;
}

/// The shared syscall record.
///
/// Submitted by reference; the kernel and the 2LS both poke at it
/// concurrently, so all mutable state is atomic.
pub struct Syscall {
    /// Syscall number (one of [`nr`]).
    pub num: u32,
    /// Up to six argument words.
    pub args: [u64; 6],
    flags: AtomicU32,
    retval: AtomicI64,
    err: AtomicU32,
    errstr: SpinLock<Option<String>>,
    ev_q: AtomicU64,
    /// 2LS-private word (e.g. the blocked uthread reference).
    pub u_data: AtomicU64,
    data: SpinLock<Vec<u8>>,
}

impl Syscall {
    /// Builds a syscall record ready for submission.
    pub fn new(num: u32, args: [u64; 6]) -> Self {
        Self {
            num,
            args,
            flags: AtomicU32::new(0),
            retval: AtomicI64::new(0),
            err: AtomicU32::new(0),
            errstr: SpinLock::new(None),
            ev_q: AtomicU64::new(0),
            u_data: AtomicU64::new(0),
            data: SpinLock::new(Vec::new()),
        }
    }

    /// Loads the in/out byte payload (channel writes put input here,
    /// channel reads leave output here).
    pub fn set_data(&self, bytes: Vec<u8>) {
        *self.data.lock() = bytes;
    }

    /// Takes the byte payload.
    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.lock())
    }

    /// Current flags snapshot.
    pub fn flags(&self) -> SyscallFlags {
        SyscallFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Whether the kernel has completed this syscall.
    pub fn done(&self) -> bool {
        self.flags().contains(SyscallFlags::SC_DONE)
    }

    /// Return value; meaningful once [`done`](Self::done).
    pub fn retval(&self) -> i64 {
        self.retval.load(Ordering::Acquire)
    }

    /// Error code, if the syscall failed.
    pub fn err(&self) -> Option<Errno> {
        Errno::from_u32(self.err.load(Ordering::Acquire))
    }

    /// Human-readable error detail, if any.
    pub fn errstr(&self) -> Option<String> {
        self.errstr.lock().clone()
    }

    // ── Kernel side ──────────────────────────────────────────────────

    /// Completion site: publishes the result and sets `SC_DONE`.
    ///
    /// Returns the ev_q to post the completion event to, if user-mode
    /// won the registration race.
    #[must_use = "a returned ev_q must receive the completion event"]
    pub fn complete(&self, retval: i64, err: Option<Errno>, errstr: &str) -> Option<EvqId> {
        self.retval.store(retval, Ordering::Release);
        if let Some(e) = err {
            self.err.store(e as u32, Ordering::Release);
            *self.errstr.lock() = Some(errstr.to_string());
        }
        wmb();
        let prev = self
            .flags
            .fetch_or(SyscallFlags::SC_DONE.bits(), Ordering::AcqRel);
        debug_assert!(
            prev & SyscallFlags::SC_DONE.bits() == 0,
            "syscall completed twice"
        );
        if prev & SyscallFlags::SC_UEVENT.bits() != 0 {
            self.bound_evq()
        } else {
            None
        }
    }

    /// Marks partial progress without completing.
    pub fn set_progress(&self) {
        self.flags
            .fetch_or(SyscallFlags::SC_PROGRESS.bits(), Ordering::AcqRel);
    }

    /// Whether an abort has been requested.
    pub fn abort_requested(&self) -> bool {
        self.flags().contains(SyscallFlags::SC_ABORT)
    }

    // ── User side ────────────────────────────────────────────────────

    /// Races completion to bind `evq` for the completion event.
    ///
    /// Returns `true` if the kernel will post to the queue; `false` if
    /// the syscall already completed (the caller must not block).
    pub fn register_evq(&self, evq: EvqId) -> bool {
        self.ev_q.store(evq.encode(), Ordering::Release);
        wrmb();
        let prev = self
            .flags
            .fetch_or(SyscallFlags::SC_UEVENT.bits(), Ordering::AcqRel);
        if prev & SyscallFlags::SC_DONE.bits() != 0 {
            // Lost the race: the kernel completed without seeing the
            // registration and will not post.
            self.flags
                .fetch_and(!SyscallFlags::SC_UEVENT.bits(), Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Unbinds the completion ev_q (abort/wakeup won some other way).
    ///
    /// Returns `true` if no completion event will arrive; `false` means
    /// one may already be (or soon land) in the queue and the consumer
    /// must treat it as stale.
    pub fn deregister_evq(&self) -> bool {
        let prev = self
            .flags
            .fetch_and(!SyscallFlags::SC_UEVENT.bits(), Ordering::AcqRel);
        prev & SyscallFlags::SC_UEVENT.bits() != 0
            && prev & SyscallFlags::SC_DONE.bits() == 0
    }

    /// Requests cancellation. The kernel still completes the syscall
    /// (typically with `EINTR`); abort is a request, not a teardown.
    pub fn request_abort(&self) {
        self.flags
            .fetch_or(SyscallFlags::SC_ABORT.bits(), Ordering::AcqRel);
    }

    fn bound_evq(&self) -> Option<EvqId> {
        EvqId::decode(self.ev_q.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_before_register_means_no_event() {
        let sc = Syscall::new(nr::BLOCK, [0; 6]);
        assert_eq!(sc.complete(7, None, ""), None);
        assert!(!sc.register_evq(EvqId(3)), "registration must lose");
        assert!(sc.done());
        assert_eq!(sc.retval(), 7);
    }

    #[test]
    fn register_before_complete_routes_event() {
        let sc = Syscall::new(nr::BLOCK, [0; 6]);
        assert!(sc.register_evq(EvqId(3)));
        assert_eq!(sc.complete(0, None, ""), Some(EvqId(3)));
    }

    #[test]
    fn deregister_prevents_event() {
        let sc = Syscall::new(nr::BLOCK, [0; 6]);
        assert!(sc.register_evq(EvqId(9)));
        assert!(sc.deregister_evq());
        assert_eq!(sc.complete(0, None, ""), None);
    }

    #[test]
    fn error_is_published_with_done() {
        let sc = Syscall::new(nr::CHAN_READ, [0; 6]);
        let _ = sc.complete(-1, Some(Errno::EINTR), "aborted by alarm");
        assert_eq!(sc.err(), Some(Errno::EINTR));
        assert_eq!(sc.errstr().unwrap(), "aborted by alarm");
    }

    #[test]
    fn registration_race_is_decided_exactly_once() {
        for _ in 0..200 {
            let sc = std::sync::Arc::new(Syscall::new(nr::BLOCK, [0; 6]));
            let sc2 = sc.clone();
            let kernel = std::thread::spawn(move || sc2.complete(1, None, ""));
            let user_won = sc.register_evq(EvqId(1));
            let kernel_posts = kernel.join().unwrap().is_some();
            assert_eq!(
                user_won, kernel_posts,
                "both or neither saw the registration"
            );
        }
    }
}
