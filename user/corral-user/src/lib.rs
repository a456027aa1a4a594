//! The user-mode scheduling substrate.
//!
//! Everything a process runs above the kernel model: the vcore-context
//! entry loop, uthreads and the second-level-scheduler hook table, event
//! queue dispatch and blocking, the process timer chain, preemption-
//! aware spinlocks, and the minimal thread0 scheduler that single-core
//! processes boot with.
//!
//! A process is born by pairing a [`UserRuntime`] with a machine: the
//! runtime registers its vcore entry as the process's fixed entry point,
//! and every core the kernel grants begins execution there.

pub mod alarm;
pub mod event;
pub mod spinlock;
pub mod syscall;
pub mod thread0;
pub mod uthread;
pub mod vcore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use corral_core::SpinLock;
use corral_core::config::MAX_VCORES;
use corral_kernel::proc::Proc;
use corral_kernel::Machine;

use crate::event::HandlerTable;
use crate::uthread::{SchedOps, Uthread};

/// Per-vcore user-side state (the runtime's vcore-local data).
pub struct VcoreLocal {
    /// The uthread this vcore last popped; set while it runs or while
    /// its interrupted context sits in the vcore's notif slot.
    pub(crate) current_uthread: SpinLock<Option<Arc<Uthread>>>,
}

impl VcoreLocal {
    fn new() -> Self {
        Self {
            current_uthread: SpinLock::new(None),
        }
    }
}

/// The per-process user runtime: glue between the kernel's core grants
/// and a second-level scheduler.
pub struct UserRuntime {
    self_ref: Weak<UserRuntime>,
    machine: Machine,
    proc: Arc<Proc>,
    ops: Arc<dyn SchedOps>,
    pub(crate) handlers: HandlerTable,
    vcore_local: Vec<VcoreLocal>,
    started: AtomicBool,
}

impl UserRuntime {
    /// Builds the runtime and its process. The process is created but
    /// not yet run; finish 2LS setup and call [`start`](Self::start).
    pub fn create(machine: &Machine, ops: Arc<dyn SchedOps>) -> Arc<Self> {
        let rt = Arc::new_cyclic(|weak: &Weak<Self>| {
            let entry_weak = weak.clone();
            let entry: corral_kernel::proc::ProgramEntry = Arc::new(move |vcoreid| {
                if let Some(rt) = entry_weak.upgrade() {
                    rt.vcore_entry(vcoreid);
                }
            });
            let proc = machine.proc_create(entry);
            Self {
                self_ref: weak.clone(),
                machine: machine.clone(),
                proc,
                ops,
                handlers: HandlerTable::default(),
                vcore_local: (0..MAX_VCORES).map(|_| VcoreLocal::new()).collect(),
                started: AtomicBool::new(false),
            }
        });
        rt.register_builtin_handlers();
        rt
    }

    /// A strong handle to ourselves (for hook-table calls that take the
    /// runtime by `Arc`).
    pub(crate) fn arc(&self) -> Arc<UserRuntime> {
        self.self_ref.upgrade().expect("runtime already torn down")
    }

    /// The machine this process runs on.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// The kernel-side process object.
    pub fn proc(&self) -> &Arc<Proc> {
        &self.proc
    }

    /// The installed scheduler ops.
    pub fn ops(&self) -> &Arc<dyn SchedOps> {
        &self.ops
    }

    pub(crate) fn vcore_local(&self, vcoreid: u32) -> &VcoreLocal {
        &self.vcore_local[vcoreid as usize]
    }

    /// Starts the process as an SCP. Idempotent.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.machine
                .proc_run(&self.proc)
                .expect("process not startable");
        }
    }

    /// Terminates the process. Must be called from one of the process's
    /// own execution contexts (uthread or vcore); does not return.
    pub fn exit(&self, status: i64) -> ! {
        self.machine.proc_exit(&self.proc, status)
    }

    /// Blocks the calling host thread (outside the process) until the
    /// process exits; returns its status.
    pub fn join(&self) -> i64 {
        self.proc.wait_exit()
    }
}
