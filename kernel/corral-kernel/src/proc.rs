//! Process management.
//!
//! A process is a container of cores: identity, the two shared regions
//! (procinfo/procdata), the vcore slots whose backing threads the kernel
//! grants pcores to, the ev_q arena the event fabric routes through, and
//! a lifecycle state machine. Processes start as single-core (SCP) and
//! may transition to many-core (MCP), after which the allocator grants
//! them dedicated cores.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use corral_abi::ctx::{UthGate, VcoreGate};
use corral_abi::procdata::ProcData;
use corral_abi::procinfo::ProcInfo;
use corral_abi::{EventQueue, EvqId};
use corral_core::SpinLock;
use corral_core::config::MAX_VCORES;

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Created, never run.
    Created,
    /// SCP, waiting for a management core.
    RunnableS,
    /// SCP, on a management core.
    RunningS,
    /// MCP, waiting for cores.
    RunnableM,
    /// MCP, holding at least one core.
    RunningM,
    /// Blocked until an event wakes it.
    Waiting,
    /// Being torn down.
    Dying,
    /// Teardown of an already-dying process (double destroy).
    DyingAbort,
}

impl ProcState {
    /// Whether the process is in (or headed for) many-core mode.
    pub fn is_mcp(self) -> bool {
        matches!(self, Self::RunnableM | Self::RunningM)
    }

    /// Whether teardown has begun.
    pub fn is_dying(self) -> bool {
        matches!(self, Self::Dying | Self::DyingAbort)
    }
}

/// The fixed per-process entry point: every vcore start and restart
/// begins execution here, in the user runtime, with its vcoreid.
pub type ProgramEntry = Arc<dyn Fn(u32) + Send + Sync>;

/// One vcore's kernel-side slot: the gate its backing thread parks on
/// and the revocation request word.
pub struct VcoreSlot {
    /// Gate the vcore-context thread parks on between grants.
    pub(crate) gate: Arc<VcoreGate>,
    /// Backing thread, spawned on first grant.
    pub(crate) thread: SpinLock<Option<std::thread::JoinHandle<()>>>,
    started: AtomicBool,
    /// Raised by the kernel to revoke the pcore; polled at interrupt
    /// points by whatever runs on the vcore.
    pub(crate) preempt_req: AtomicBool,
    /// True while a pcore loop is blocked driving this vcore. Teardown
    /// uses it to decide whether a final reply is owed.
    pub(crate) online: AtomicBool,
}

impl VcoreSlot {
    fn new() -> Self {
        Self {
            gate: Arc::new(VcoreGate::new()),
            thread: SpinLock::new(None),
            started: AtomicBool::new(false),
            preempt_req: AtomicBool::new(false),
            online: AtomicBool::new(false),
        }
    }

    /// Whether the backing thread exists yet.
    pub(crate) fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn set_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Whether a revocation is requested.
    pub fn preempt_requested(&self) -> bool {
        self.preempt_req.load(Ordering::Acquire)
    }

    pub(crate) fn set_preempt_req(&self, req: bool) {
        self.preempt_req.store(req, Ordering::SeqCst);
    }
}

/// Slab arena owning a process's event queues.
///
/// Indirection payloads carry [`EvqId`] slab indices instead of
/// pointers; a removed queue leaves stale ids resolving to `None`, so
/// in-flight indirections for a torn-down queue are inert.
#[derive(Default)]
pub struct EvqArena {
    slots: SpinLock<Vec<Option<Arc<EventQueue>>>>,
}

impl EvqArena {
    /// Registers a queue, assigning its id.
    pub fn insert(&self, evq: Arc<EventQueue>) -> EvqId {
        let mut slots = self.slots.lock();
        let idx = slots.iter().position(Option::is_none).unwrap_or_else(|| {
            slots.push(None);
            slots.len() - 1
        });
        #[expect(clippy::cast_possible_truncation, reason = "slab index")]
        let id = EvqId(idx as u32);
        evq.set_id(id);
        slots[idx] = Some(evq);
        id
    }

    /// Resolves an id to a live queue.
    pub fn get(&self, id: EvqId) -> Option<Arc<EventQueue>> {
        self.slots.lock().get(id.0 as usize)?.clone()
    }

    /// Removes a queue. In-flight deliveries referencing the id become
    /// no-ops; the queue itself lives until the last `Arc` drops.
    pub fn remove(&self, id: EvqId) -> Option<Arc<EventQueue>> {
        self.slots.lock().get_mut(id.0 as usize)?.take()
    }
}

/// A process.
pub struct Proc {
    pid: u32,
    state: Mutex<ProcState>,
    state_cv: Condvar,
    procinfo: Arc<ProcInfo>,
    procdata: Arc<ProcData>,
    entry: ProgramEntry,
    vcores: Vec<VcoreSlot>,
    /// Event queue arena (kernel routes through it, user owns it).
    pub evqs: EvqArena,
    exit_status: AtomicI64,
    /// Uthread gates registered by the user runtime so kernel-initiated
    /// teardown can wake every parked uthread.
    uth_gates: SpinLock<Vec<Weak<UthGate>>>,
    /// Serializes vcoremap/pcoremap mutation (grant, yield, preempt,
    /// change_vcore) for this process.
    pub(crate) vcore_lock: SpinLock<()>,
}

impl Proc {
    pub(crate) fn new(pid: u32, ppid: u32, entry: ProgramEntry) -> Arc<Self> {
        Arc::new(Self {
            pid,
            state: Mutex::new(ProcState::Created),
            state_cv: Condvar::new(),
            procinfo: Arc::new(ProcInfo::new(pid, ppid)),
            procdata: Arc::new(ProcData::new()),
            entry,
            vcores: (0..MAX_VCORES).map(|_| VcoreSlot::new()).collect(),
            evqs: EvqArena::default(),
            exit_status: AtomicI64::new(0),
            uth_gates: SpinLock::new(Vec::new()),
            vcore_lock: SpinLock::new(()),
        })
    }

    /// Process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The read-only shared region.
    pub fn procinfo(&self) -> &Arc<ProcInfo> {
        &self.procinfo
    }

    /// The read-write shared region.
    pub fn procdata(&self) -> &Arc<ProcData> {
        &self.procdata
    }

    /// The program's vcore entry point.
    pub(crate) fn entry(&self) -> &ProgramEntry {
        &self.entry
    }

    /// A vcore's kernel-side slot.
    pub(crate) fn vcore(&self, vcoreid: u32) -> &VcoreSlot {
        &self.vcores[vcoreid as usize]
    }

    /// Public view of a vcore's revocation word.
    pub fn vcore_preempt_requested(&self, vcoreid: u32) -> bool {
        self.vcores[vcoreid as usize].preempt_requested()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcState {
        *self.state.lock().unwrap()
    }

    /// Whether teardown has begun.
    pub fn dying(&self) -> bool {
        self.state().is_dying()
    }

    pub(crate) fn set_state(&self, new: ProcState) {
        let mut st = self.state.lock().unwrap();
        log::trace!("pid {}: state {:?} -> {:?}", self.pid, *st, new);
        *st = new;
        self.state_cv.notify_all();
    }

    /// Transitions state only if the current state passes `pred`.
    /// Returns the previous state on success.
    pub(crate) fn set_state_if(
        &self,
        pred: impl Fn(ProcState) -> bool,
        new: ProcState,
    ) -> Result<ProcState, ProcState> {
        let mut st = self.state.lock().unwrap();
        if pred(*st) {
            let old = *st;
            *st = new;
            self.state_cv.notify_all();
            Ok(old)
        } else {
            Err(*st)
        }
    }

    /// Blocks the calling (host) thread until the process dies, and
    /// returns its exit status. Test harness convenience.
    pub fn wait_exit(&self) -> i64 {
        let mut st = self.state.lock().unwrap();
        while !st.is_dying() {
            st = self.state_cv.wait(st).unwrap();
        }
        drop(st);
        // The pcore loop may still be finishing bookkeeping; the status
        // was published before the state flip.
        self.exit_status.load(Ordering::Acquire)
    }

    pub(crate) fn set_exit_status(&self, status: i64) {
        self.exit_status.store(status, Ordering::Release);
    }

    pub(crate) fn exit_status_now(&self) -> i64 {
        self.exit_status.load(Ordering::Acquire)
    }

    /// Registers a uthread gate for teardown delivery.
    pub fn register_uth_gate(&self, gate: &Arc<UthGate>) {
        self.uth_gates.lock().push(Arc::downgrade(gate));
    }

    /// Wakes every registered parked uthread with a teardown message.
    pub(crate) fn teardown_uthreads(&self) {
        for weak in self.uth_gates.lock().drain(..) {
            if let Some(gate) = weak.upgrade() {
                gate.post(corral_abi::ctx::ResumeMsg::Teardown);
            }
        }
    }

}

/// The machine-wide process table.
#[derive(Default)]
pub(crate) struct ProcTable {
    procs: SpinLock<BTreeMap<u32, Arc<Proc>>>,
}

impl ProcTable {
    pub(crate) fn insert(&self, proc: &Arc<Proc>) {
        self.procs.lock().insert(proc.pid(), proc.clone());
    }

    pub(crate) fn get(&self, pid: u32) -> Option<Arc<Proc>> {
        self.procs.lock().get(&pid).cloned()
    }

    pub(crate) fn remove(&self, pid: u32) -> Option<Arc<Proc>> {
        self.procs.lock().remove(&pid)
    }

    pub(crate) fn all(&self) -> Vec<Arc<Proc>> {
        self.procs.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_entry() -> ProgramEntry {
        Arc::new(|_vcoreid| {})
    }

    #[test]
    fn evq_arena_reuses_slots() {
        let arena = EvqArena::default();
        let q1 = Arc::new(EventQueue::new(
            corral_event::MboxKind::Bitmap,
            corral_abi::EvqFlags::empty(),
        ));
        let id1 = arena.insert(q1.clone());
        assert!(arena.get(id1).is_some());
        arena.remove(id1);
        assert!(arena.get(id1).is_none(), "stale id must be inert");
        let q2 = Arc::new(EventQueue::new(
            corral_event::MboxKind::Bitmap,
            corral_abi::EvqFlags::empty(),
        ));
        let id2 = arena.insert(q2);
        assert_eq!(id1, id2, "slab slot not reused");
    }

    #[test]
    fn state_guarded_transition() {
        let p = Proc::new(1, 0, dummy_entry());
        assert_eq!(p.state(), ProcState::Created);
        assert!(p.set_state_if(|s| s == ProcState::Created, ProcState::RunnableS).is_ok());
        assert!(
            p.set_state_if(|s| s == ProcState::Created, ProcState::RunnableS)
                .is_err()
        );
    }
}
