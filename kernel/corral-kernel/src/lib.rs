//! The corral machine model.
//!
//! An in-process kernel: physical cores are dedicated host threads, a
//! process is a container of cores, and the kernel hands whole cores to
//! a process's vcores. User-mode runtimes drive their uthreads on those
//! vcores and talk back through the shared regions, the asynchronous
//! syscall contract, and the event fabric.
//!
//! Everything observable follows the real protocol: notifications and
//! revocations are flags raised by the kernel and honored by user code
//! at interrupt points, contexts are saved into procdata slots, and
//! events flow through user-owned mailboxes the kernel writes on the
//! process's behalf.

pub mod alarm;
pub mod chan;
pub mod event;
pub mod pcore;
pub mod percpu;
pub mod proc;
pub mod sched;
pub mod syscall;
pub mod vcore;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};

use corral_abi::ctx::{TeardownUnwind, VcoreRet, VcoreRun, raise_teardown};
use corral_abi::{Errno, RES_CORES};
use corral_core::config::{MAX_PCORES, MAX_VCORES};

use crate::alarm::AlarmDev;
use crate::chan::ChanTable;
use crate::pcore::{Pcore, PcoreCmd};
use crate::proc::{Proc, ProcState, ProcTable, ProgramEntry};
use crate::sched::Ksched;
use crate::syscall::PendingTable;

pub use crate::proc::ProcState as State;
pub use crate::syscall::sysc_addr;
pub use crate::vcore::PollResult;

/// Microseconds of advance warning a revocation gives the vcore.
pub const PREEMPT_WARN_USEC: u64 = 10_000;

/// Machine sizing.
#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    /// Total pcores (LL + CG).
    pub nr_pcores: u32,
    /// Low-latency management cores (run SCPs), ids `0..nr_ll`.
    pub nr_ll: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            nr_pcores: 8,
            nr_ll: 1,
        }
    }
}

pub(crate) struct MachineInner {
    cfg: MachineConfig,
    pcores: Vec<Arc<Pcore>>,
    procs: ProcTable,
    pub(crate) sched: Ksched,
    pub(crate) alarm: Arc<AlarmDev>,
    pub(crate) chans: ChanTable,
    pub(crate) pending: PendingTable,
    next_pid: AtomicU32,
}

/// Handle to the machine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Machine {
    inner: Arc<MachineInner>,
}

impl Machine {
    /// Boots the machine: spawns one thread per pcore and the alarm
    /// device thread.
    ///
    /// # Panics
    ///
    /// Panics on nonsensical configs (zero cores, no CG cores, more
    /// cores than the fixed map sizes).
    pub fn bring_up(cfg: MachineConfig) -> Self {
        assert!(cfg.nr_ll >= 1, "need at least one management core");
        assert!(cfg.nr_pcores > cfg.nr_ll, "need at least one CG core");
        assert!((cfg.nr_pcores as usize) <= MAX_PCORES);
        install_teardown_hook();

        let inner = Arc::new(MachineInner {
            cfg,
            pcores: (0..cfg.nr_pcores)
                .map(|id| Arc::new(Pcore::new(id, id < cfg.nr_ll)))
                .collect(),
            procs: ProcTable::default(),
            sched: Ksched::new(cfg.nr_pcores, cfg.nr_ll),
            alarm: Arc::new(AlarmDev::new()),
            chans: ChanTable::default(),
            pending: PendingTable::default(),
            next_pid: AtomicU32::new(0),
        });
        for pc in &inner.pcores {
            Pcore::start(pc, Arc::downgrade(&inner));
        }
        AlarmDev::start(&inner.alarm, Arc::downgrade(&inner));
        log::info!(
            "machine up: {} pcores ({} LL)",
            cfg.nr_pcores,
            cfg.nr_ll
        );
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<MachineInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &MachineInner {
        &self.inner
    }

    /// Total pcores.
    pub fn nr_pcores(&self) -> u32 {
        self.inner.cfg.nr_pcores
    }

    /// Management (LL) core count; CG cores are `nr_ll..nr_pcores`.
    pub fn nr_ll_cores(&self) -> u32 {
        self.inner.cfg.nr_ll
    }

    /// Stops the alarm device and the pcore loops. Call after all
    /// processes are destroyed; cores still granted will not be joined.
    pub fn shutdown(&self) {
        self.inner.alarm.shutdown();
        for pc in &self.inner.pcores {
            pc.send(PcoreCmd::Shutdown);
        }
        for pc in &self.inner.pcores {
            pc.join();
        }
    }

    // ── Process lifecycle ────────────────────────────────────────────

    /// Creates a process whose vcores start at `entry`.
    pub fn proc_create(&self, entry: ProgramEntry) -> Arc<Proc> {
        let pid = self.inner.next_pid.fetch_add(1, Ordering::Relaxed) + 1;
        let proc = Proc::new(pid, 0, entry);
        self.inner.procs.insert(&proc);
        self.inner.sched.proc_register(pid);
        log::debug!("pid {pid}: created");
        proc
    }

    /// Starts a created process as an SCP.
    pub fn proc_run(&self, proc: &Arc<Proc>) -> Result<(), Errno> {
        proc.set_state_if(|s| s == ProcState::Created, ProcState::RunnableS)
            .map_err(|_| Errno::EINVAL)?;
        self.inner.sched.scp_runnable(proc.pid());
        self.run_scheduler();
        Ok(())
    }

    /// Destroys a process: revokes its cores, wakes every parked thread
    /// for teardown, and forgets it everywhere.
    pub fn proc_destroy(&self, proc: &Arc<Proc>, status: i64) {
        self.destroy_proc(proc, status);
    }

    /// Process self-exit, called on a thread currently executing as one
    /// of the process's vcores. Does not return.
    pub fn proc_exit(&self, proc: &Arc<Proc>, status: i64) -> ! {
        self.destroy_proc(proc, status);
        raise_teardown()
    }

    /// Looks up a process by pid.
    pub fn lookup_proc(&self, pid: u32) -> Option<Arc<Proc>> {
        self.inner.procs.get(pid)
    }

    /// Destroy postcondition probe: the pid owns no pcore and sits in no
    /// allocator list.
    pub fn proc_fully_released(&self, pid: u32) -> bool {
        sched::assert_proc_gone(&self.inner.sched, pid)
    }

    pub(crate) fn destroy_proc(&self, proc: &Arc<Proc>, status: i64) {
        if proc
            .set_state_if(|s| !s.is_dying(), ProcState::Dying)
            .is_err()
        {
            return;
        }
        proc.set_exit_status(status);
        log::info!("pid {}: dying (status {status})", proc.pid());
        // Wake parked vcore threads; running ones unwind at their next
        // interrupt point.
        #[expect(clippy::cast_possible_truncation, reason = "config constant")]
        for v in 0..MAX_VCORES as u32 {
            let slot = proc.vcore(v);
            if slot.started() && !slot.online.load(Ordering::Acquire) {
                slot.gate.post(VcoreRun::Teardown);
            }
        }
        proc.teardown_uthreads();
        // Cancel kernel-parked syscalls.
        for entry in self.inner.pending.take_all_for_pid(proc.pid()) {
            let _ = entry.sysc.complete(-1, Some(Errno::EINTR), "process dying");
        }
        self.inner.alarm.cancel_proc(proc.pid());
        self.inner.sched.proc_destroy_cleanup(proc.pid());
        self.inner.procs.remove(proc.pid());
        self.run_scheduler();
    }

    /// Pcore-loop path: a vcore reported process exit.
    pub(crate) fn finish_proc_exit(&self, proc: &Arc<Proc>, status: i64) {
        self.destroy_proc(proc, status);
    }

    // ── SCP to MCP ───────────────────────────────────────────────────

    /// Flips an SCP into many-core mode wanting `nr_vcores` cores.
    ///
    /// Bookkeeping only; the caller (user runtime, on the SCP's vcore)
    /// must have saved its context into vcore 0's notif slot and must
    /// follow up by handing its management core back, after which the
    /// allocator grants CG cores and vcore 0 restarts at vcore entry.
    pub fn sys_change_to_m(&self, proc: &Arc<Proc>, nr_vcores: u32) -> Result<(), Errno> {
        if nr_vcores == 0 || nr_vcores > proc.procinfo().max_vcores() {
            return Err(Errno::EINVAL);
        }
        proc.set_state_if(|s| s == ProcState::RunningS, ProcState::RunnableM)
            .map_err(|_| Errno::EINVAL)?;
        let pi = proc.procinfo();
        proc.procdata().set_res_desire(RES_CORES, nr_vcores);
        pi.set_mcp();
        self.inner.sched.proc_change_to_m(proc.pid());
        {
            let _g = proc.vcore_lock.lock();
            let slot = proc.vcore(0);
            pi.coremap_write(|| {
                let e = pi.vcoremap(0);
                if slot.preempt_requested() {
                    slot.set_preempt_req(false);
                    if e.preempted() {
                        e.inc_preempts_done();
                    }
                }
                if e.valid() {
                    pi.pcoremap(e.pcoreid()).clear();
                    e.set_unmapped();
                }
                pi.set_num_vcores(0);
            });
        }
        log::info!(
            "pid {}: SCP -> MCP, wants {nr_vcores} cores",
            proc.pid()
        );
        Ok(())
    }

    // ── Allocator plumbing ───────────────────────────────────────────

    /// Runs (or coalesces into) a scheduling pass.
    pub fn run_scheduler(&self) {
        self.inner.sched.poke(self);
    }

    pub(crate) fn core_returned(&self, pcoreid: u32, proc: &Arc<Proc>) {
        self.inner.sched.core_returned(pcoreid, proc.pid());
        self.run_scheduler();
    }

    /// Binds a granted pcore to a vcore and kicks the pcore loop.
    pub(crate) fn execute_grant(&self, pid: u32, pcoreid: u32, scp: bool) {
        let Some(proc) = self.lookup_proc(pid) else {
            self.inner.sched.core_returned(pcoreid, pid);
            return;
        };
        if proc.dying() {
            self.inner.sched.core_returned(pcoreid, pid);
            return;
        }
        let pi = proc.procinfo();
        let picked = {
            let _g = proc.vcore_lock.lock();
            let pick = if scp {
                if pi.vcoremap(0).valid() { None } else { Some(0) }
            } else {
                #[expect(clippy::cast_possible_truncation, reason = "config constant")]
                let max = MAX_VCORES as u32;
                // Restart preempted vcores before growing fresh ones.
                (0..max)
                    .find(|&v| {
                        let e = pi.vcoremap(v);
                        e.valid() && e.preempted()
                    })
                    .or_else(|| (0..max).find(|&v| !pi.vcoremap(v).valid()))
            };
            if let Some(v) = pick {
                pi.coremap_write(|| {
                    let e = pi.vcoremap(v);
                    let restart = e.valid();
                    e.set_mapped(pcoreid);
                    if restart {
                        e.inc_preempts_done();
                    } else {
                        pi.set_num_vcores(pi.num_vcores() + 1);
                    }
                    pi.pcoremap(pcoreid).set(v);
                });
            }
            pick
        };
        let Some(vcoreid) = picked else {
            self.inner.sched.core_returned(pcoreid, pid);
            return;
        };
        // Vcore entry begins in vcore context.
        proc.procdata().vcpd(vcoreid).set_notif_disabled(true);
        pi.set_res_grant(RES_CORES, pi.num_vcores());
        if scp {
            let _ = proc.set_state_if(|s| s == ProcState::RunnableS, ProcState::RunningS);
        } else {
            let _ = proc.set_state_if(|s| s == ProcState::RunnableM, ProcState::RunningM);
        }
        log::trace!("granting pcore {pcoreid} to pid {pid} vcore {vcoreid}");
        self.inner.pcores[pcoreid as usize].send(PcoreCmd::Grant { proc, vcoreid });
    }

    /// Spawns a vcore's backing thread if it does not exist yet.
    pub(crate) fn ensure_vcore_thread(&self, proc: &Arc<Proc>, vcoreid: u32) {
        let slot = proc.vcore(vcoreid);
        if slot.started() {
            return;
        }
        slot.set_started();
        let gate = slot.gate.clone();
        let proc = proc.clone();
        let pid = proc.pid();
        let handle = std::thread::Builder::new()
            .name(format!("vcore-{pid}-{vcoreid}"))
            .spawn(move || {
                loop {
                    match gate.wait() {
                        VcoreRun::Teardown => return,
                        VcoreRun::Grant => {
                            percpu::set_current(pid, vcoreid);
                            let entry = proc.entry().clone();
                            let result = std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(|| entry(vcoreid)),
                            );
                            percpu::clear_current();
                            let status = proc.exit_status_now();
                            let owes_reply =
                                proc.vcore(vcoreid).online.load(Ordering::Acquire);
                            match result {
                                Ok(()) => {
                                    if owes_reply {
                                        gate.finish(VcoreRet::ProcExit { status });
                                    }
                                    return;
                                }
                                Err(payload) => {
                                    if payload.is::<TeardownUnwind>() {
                                        if owes_reply {
                                            gate.finish(VcoreRet::ProcExit { status });
                                        }
                                        return;
                                    }
                                    // Real panic in user code: unblock the
                                    // pcore, then propagate.
                                    if owes_reply {
                                        gate.finish(VcoreRet::ProcExit { status: -1 });
                                    }
                                    std::panic::resume_unwind(payload);
                                }
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn vcore thread");
        *slot.thread.lock() = Some(handle);
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Creates a kernel byte channel.
    pub fn chan_create(&self) -> u64 {
        self.inner.chans.create()
    }
}

/// Process-teardown unwinds are expected; keep the default panic hook
/// quiet about them.
fn install_teardown_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().is::<TeardownUnwind>() {
                return;
            }
            prev(info);
        }));
    });
}
