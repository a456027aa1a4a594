//! Physical cores.
//!
//! Each pcore is a dedicated host thread running a grant loop: wait for
//! the allocator to bind a (process, vcore) pair, drive that vcore until
//! it hands the core back, report the outcome, repeat. Pcores are
//! partitioned into LL (low-latency management, run SCPs) and CG
//! (coarse-grained, granted to MCPs).

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, Weak};

use corral_abi::ctx::{VcoreRet, VcoreRun};
use corral_core::SpinLock;

use crate::proc::Proc;
use crate::{Machine, MachineInner};

/// Command deposited into a pcore's grant slot.
pub(crate) enum PcoreCmd {
    /// Run this vcore until it hands the core back.
    Grant {
        /// Process granted the core.
        proc: Arc<Proc>,
        /// Vcore bound to this pcore.
        vcoreid: u32,
    },
    /// Machine teardown.
    Shutdown,
}

/// A physical core.
pub(crate) struct Pcore {
    pub(crate) id: u32,
    pub(crate) is_ll: bool,
    slot: Mutex<Option<PcoreCmd>>,
    cv: Condvar,
    thread: SpinLock<Option<std::thread::JoinHandle<()>>>,
}

impl Pcore {
    pub(crate) fn new(id: u32, is_ll: bool) -> Self {
        Self {
            id,
            is_ll,
            slot: Mutex::new(None),
            cv: Condvar::new(),
            thread: SpinLock::new(None),
        }
    }

    /// Deposits a command for the pcore loop.
    ///
    /// The allocator only grants idle cores, so the slot is empty except
    /// for the shutdown race at machine teardown.
    pub(crate) fn send(&self, cmd: PcoreCmd) {
        let mut slot = self.slot.lock().unwrap();
        if matches!(*slot, Some(PcoreCmd::Shutdown)) {
            return;
        }
        debug_assert!(
            slot.is_none() || matches!(cmd, PcoreCmd::Shutdown),
            "granted a non-idle pcore"
        );
        *slot = Some(cmd);
        self.cv.notify_all();
    }

    fn recv(&self) -> PcoreCmd {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(cmd) = slot.take() {
                return cmd;
            }
            slot = self.cv.wait(slot).unwrap();
        }
    }

    /// Spawns the pcore loop thread.
    pub(crate) fn start(this: &Arc<Self>, machine: Weak<MachineInner>) {
        let pcore = this.clone();
        let handle = std::thread::Builder::new()
            .name(format!("pcore-{}", this.id))
            .spawn(move || pcore.run(&machine))
            .expect("failed to spawn pcore thread");
        *this.thread.lock() = Some(handle);
    }

    pub(crate) fn join(&self) {
        if let Some(h) = self.thread.lock().take() {
            let _ = h.join();
        }
    }

    /// The grant loop.
    fn run(&self, machine: &Weak<MachineInner>) {
        loop {
            match self.recv() {
                PcoreCmd::Shutdown => return,
                PcoreCmd::Grant { proc, vcoreid } => {
                    let Some(inner) = machine.upgrade() else {
                        return;
                    };
                    self.run_bound(&Machine::from_inner(inner), proc, vcoreid);
                }
            }
        }
    }

    /// Drives a vcore (and any vcore it hands off to) until the core
    /// comes back, then reports to the allocator.
    fn run_bound(&self, machine: &Machine, proc: Arc<Proc>, mut vcoreid: u32) {
        loop {
            let slot = proc.vcore(vcoreid);
            machine.ensure_vcore_thread(&proc, vcoreid);
            log::trace!("pcore {}: running pid {} vcore {}", self.id, proc.pid(), vcoreid);
            slot.online.store(true, Ordering::Release);
            let ret = slot.gate.call(VcoreRun::Grant);
            slot.online.store(false, Ordering::Release);
            match ret {
                VcoreRet::CoreYielded => {
                    log::trace!("pcore {}: pid {} vcore {} yielded", self.id, proc.pid(), vcoreid);
                    machine.core_returned(self.id, &proc);
                    return;
                }
                VcoreRet::Preempted => {
                    log::debug!(
                        "pcore {}: pid {} vcore {} preempted",
                        self.id,
                        proc.pid(),
                        vcoreid
                    );
                    machine.core_returned(self.id, &proc);
                    return;
                }
                VcoreRet::ChangeTo { target, .. } => {
                    log::trace!(
                        "pcore {}: pid {} vcore {} -> vcore {}",
                        self.id,
                        proc.pid(),
                        vcoreid,
                        target
                    );
                    vcoreid = target;
                }
                VcoreRet::ProcExit { status } => {
                    log::debug!(
                        "pcore {}: pid {} exited with status {status}",
                        self.id,
                        proc.pid()
                    );
                    machine.finish_proc_exit(&proc, status);
                    machine.core_returned(self.id, &proc);
                    return;
                }
            }
        }
    }
}
