//! Uthreads and the second-level-scheduler substrate.
//!
//! A uthread is a cooperatively scheduled unit of execution backed by a
//! gated host thread; its saved [`UserContext`] is the handle that moves
//! between the uthread's own save slot and the per-vcore notif slot.
//! Popping a context clears `notif_disabled` atomically with the
//! restore: if a notification slipped in, the pop is abandoned and
//! vcore entry re-runs.
//!
//! The 2LS plugs in through [`SchedOps`]; the substrate guarantees
//! save/restore fidelity, migration rules (`DONT_MIGRATE`), and the
//! notif-disable nesting uthread code uses around vcore-touching
//! critical sections.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use corral_abi::Syscall;
use corral_abi::ctx::{
    AncillaryState, CtxKind, ResumeMsg, SuspendMsg, TeardownUnwind, UserContext, UthGate,
    raise_teardown,
};
use corral_core::SpinLock;
use corral_core::atomic::{cmb, wrmb};
use corral_kernel::proc::Proc;

use crate::UserRuntime;
use crate::vcore::{self, VcoreTls, current_uthread, in_vcore_context, vcore_id};

bitflags::bitflags! {
    /// Uthread state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UthreadFlags: u32 {
        /// Must not be restarted on a different vcore than it was saved
        /// on (TLS/identity-sensitive sequence in progress).
        const DONT_MIGRATE = 1 << 0;
        /// A saved context is parked in the uthread's save slot.
        const SAVED = 1 << 1;
        /// Ancillary (FP) state was saved with the context.
        const FPSAVED = 1 << 2;
        /// The thread body has exited.
        const DEAD = 1 << 3;
    }
}

/// Callback run in vcore context after a cooperative yield.
pub type YieldCb = Box<dyn FnOnce(&Arc<Uthread>) + Send>;

/// What the 2LS wants the vcore to do next.
pub enum SchedDecision {
    /// Pop this uthread.
    Run(Arc<Uthread>),
    /// Nothing runnable: give the core back (vcore entry yields and
    /// re-enters when the kernel wakes the process).
    Idle,
}

/// The 2LS hook table. All hooks run in vcore context except none;
/// keep them short and non-blocking.
pub trait SchedOps: Send + Sync {
    /// Pick what this vcore runs next.
    fn sched_entry(&self, rt: &Arc<UserRuntime>, vcoreid: u32) -> SchedDecision;
    /// `uth` became runnable (wakeup, preemption recovery done).
    fn thread_runnable(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>);
    /// `uth` was paused mid-run by preemption recovery; requeue it.
    fn thread_paused(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>);
    /// `uth` blocked on something 2LS-external (event queue, mutex).
    fn thread_has_blocked(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>);
    /// `uth` issued `sysc` and must sleep until it completes.
    fn thread_blockon_sysc(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>, sysc: &Arc<Syscall>);
    /// A fault was reflected to user-mode on behalf of `uth`.
    fn thread_refl_fault(&self, rt: &Arc<UserRuntime>, uth: &Arc<Uthread>, fault: &str);
}

static NEXT_UTH_ID: AtomicU64 = AtomicU64::new(0);

/// A user-level thread.
pub struct Uthread {
    id: u64,
    self_ref: Weak<Uthread>,
    rt: Weak<UserRuntime>,
    pub(crate) gate: Arc<UthGate>,
    flags: AtomicU32,
    notif_disabled_depth: AtomicU32,
    saved_ctx: SpinLock<Option<UserContext>>,
    pending_yield: SpinLock<Option<YieldCb>>,
    /// The syscall this uthread is blocked on, if any (2LS bookkeeping).
    pub sysc: SpinLock<Option<Arc<Syscall>>>,
    anc: SpinLock<AncillaryState>,
    last_vcore: AtomicU32,
    finished: AtomicBool,
    thread: SpinLock<Option<std::thread::JoinHandle<()>>>,
}

impl Uthread {
    /// Stable id for 2LS-private maps.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current flag snapshot.
    pub fn flags(&self) -> UthreadFlags {
        UthreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, f: UthreadFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    fn clear_flag(&self, f: UthreadFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    /// The vcore this uthread last ran on.
    pub fn last_vcore(&self) -> u32 {
        self.last_vcore.load(Ordering::Acquire)
    }

    /// Writes a scratch FP register (ancillary state).
    pub fn set_fp_reg(&self, idx: usize, val: u64) {
        self.anc.lock().fp_regs[idx] = val;
    }

    /// Reads a scratch FP register.
    pub fn fp_reg(&self, idx: usize) -> u64 {
        self.anc.lock().fp_regs[idx]
    }

    fn anc_snapshot(&self) -> AncillaryState {
        *self.anc.lock()
    }

    /// Parks a saved context in the uthread's own slot.
    pub(crate) fn put_saved_ctx(&self, ctx: UserContext) {
        let mut slot = self.saved_ctx.lock();
        assert!(slot.is_none(), "uthread already has a saved context");
        if matches!(ctx.kind(), CtxKind::Hardware) {
            self.set_flag(UthreadFlags::FPSAVED);
        }
        self.set_flag(UthreadFlags::SAVED);
        *slot = Some(ctx);
    }

    /// Takes the saved context for a pop.
    pub(crate) fn take_saved_ctx(&self) -> Option<UserContext> {
        let ctx = self.saved_ctx.lock().take();
        if ctx.is_some() {
            self.clear_flag(UthreadFlags::SAVED | UthreadFlags::FPSAVED);
        }
        ctx
    }

    /// Reattaches a context recovered from a vcore's notif slot (after
    /// the owning vcore was preempted).
    pub fn reattach_ctx(&self, ctx: UserContext) {
        self.put_saved_ctx(ctx);
    }

    pub(crate) fn set_pending_yield(&self, cb: YieldCb) {
        *self.pending_yield.lock() = Some(cb);
    }

    pub(crate) fn take_pending_yield(&self) -> Option<YieldCb> {
        self.pending_yield.lock().take()
    }

    /// Nested notif-disable depth (uthread-side critical sections).
    pub fn notif_disabled_depth(&self) -> u32 {
        self.notif_disabled_depth.load(Ordering::Acquire)
    }

    /// Saves this uthread's interrupted state into the vcore's notif
    /// slot (notification or uthread-context preemption).
    pub(crate) fn save_to_notif_slot(&self, proc: &Arc<Proc>, vcoreid: u32) {
        let ctx = UserContext::new(CtxKind::Hardware, self.gate.clone(), self.anc_snapshot());
        self.set_flag(UthreadFlags::SAVED | UthreadFlags::FPSAVED);
        proc.procdata().vcpd(vcoreid).save_uthread_ctx(ctx);
    }

    /// Hands control back to the popping vcore and parks until the next
    /// pop. Runs on the uthread's host thread.
    pub(crate) fn suspend(&self, msg: SuspendMsg) {
        match self.gate.yield_back(msg) {
            ResumeMsg::Run { vcoreid } => self.on_resumed(vcoreid),
            ResumeMsg::Teardown => raise_teardown(),
        }
    }

    /// Refreshes thread identity after a pop (possibly on a new vcore).
    fn on_resumed(&self, vcoreid: u32) {
        let Some(rt) = self.rt.upgrade() else {
            raise_teardown()
        };
        self.clear_flag(UthreadFlags::SAVED | UthreadFlags::FPSAVED);
        self.last_vcore.store(vcoreid, Ordering::Release);
        let this = self.self_ref.upgrade().expect("uthread outlived its Arc");
        vcore::set_tls(VcoreTls {
            rt,
            vcoreid,
            in_vcore_ctx: false,
            uthread: Some(this),
        });
    }
}

impl Drop for Uthread {
    fn drop(&mut self) {
        // The backing thread either exited or is parked waiting for a
        // resume that will never come; teardown wakes it.
        if !self.finished.load(Ordering::Acquire) {
            self.gate.post(ResumeMsg::Teardown);
        }
        if let Some(h) = self.thread.lock().take() {
            // The last reference can die on the uthread's own thread
            // (TLS teardown); joining ourselves would never return.
            if h.thread().id() != std::thread::current().id() {
                let _ = h.join();
            }
        }
    }
}

/// Creates a uthread whose body runs `func` once popped. The 2LS owns
/// making it runnable.
pub fn uthread_create(
    rt: &Arc<UserRuntime>,
    func: impl FnOnce() + Send + 'static,
) -> Arc<Uthread> {
    let gate = Arc::new(UthGate::new());
    let id = NEXT_UTH_ID.fetch_add(1, Ordering::Relaxed);
    let uth = Arc::new_cyclic(|weak: &Weak<Uthread>| Uthread {
        id,
        self_ref: weak.clone(),
        rt: Arc::downgrade(rt),
        gate: gate.clone(),
        flags: AtomicU32::new(0),
        notif_disabled_depth: AtomicU32::new(0),
        saved_ctx: SpinLock::new(None),
        pending_yield: SpinLock::new(None),
        sysc: SpinLock::new(None),
        anc: SpinLock::new(AncillaryState::default()),
        last_vcore: AtomicU32::new(0),
        finished: AtomicBool::new(false),
        thread: SpinLock::new(None),
    });
    rt.proc().register_uth_gate(&gate);

    let body_uth = uth.clone();
    let pid = rt.proc().pid();
    let handle = std::thread::Builder::new()
        .name(format!("uth-{pid}-{id}"))
        .spawn(move || {
            match body_uth.gate.wait() {
                ResumeMsg::Run { vcoreid } => body_uth.on_resumed(vcoreid),
                ResumeMsg::Teardown => return,
            }
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(func));
            body_uth.set_flag(UthreadFlags::DEAD);
            match result {
                Ok(()) => {
                    if !body_uth.finished.swap(true, Ordering::AcqRel) {
                        body_uth.gate.finish(SuspendMsg::Exited);
                    }
                }
                Err(payload) => {
                    if !body_uth.finished.swap(true, Ordering::AcqRel) {
                        body_uth.gate.finish(SuspendMsg::Exited);
                    }
                    if !payload.is::<TeardownUnwind>() {
                        std::panic::resume_unwind(payload);
                    }
                }
            }
        })
        .expect("failed to spawn uthread");
    *uth.thread.lock() = Some(handle);

    // The fresh context is a cooperative (software) one.
    let ctx = UserContext::new(CtxKind::Software, gate, AncillaryState::default());
    uth.put_saved_ctx(ctx);
    uth
}

/// Cooperatively yields the calling uthread.
///
/// With `save`, the context is saved and the uthread can be resumed
/// later; `cb` runs in vcore context right after the switch (this is
/// where `thread_has_blocked`/queue-parking happens). Without `save`,
/// the uthread is exiting: `cb` still runs in vcore context, and the
/// calling thread never returns.
pub fn uthread_yield(save: bool, cb: impl FnOnce(&Arc<Uthread>) + Send + 'static) {
    assert!(!in_vcore_context(), "yield from vcore context");
    let uth = current_uthread().expect("yield outside a uthread");
    let rt = vcore::current_rt().expect("yield outside a process");
    let vcoreid = vcore_id();
    uth.set_pending_yield(Box::new(cb));
    let vcpd = rt.proc().procdata().vcpd(vcoreid);
    if save {
        let ctx =
            UserContext::new(CtxKind::Software, uth.gate.clone(), *uth.anc.lock());
        uth.put_saved_ctx(ctx);
        vcpd.set_notif_disabled(true);
        uth.suspend(SuspendMsg::Yielded);
    } else {
        // Exiting: deliver the yield without parking, then unwind.
        uth.set_flag(UthreadFlags::DEAD);
        vcpd.set_notif_disabled(true);
        uth.finished.store(true, Ordering::Release);
        uth.gate.finish(SuspendMsg::Yielded);
        raise_teardown();
    }
}

/// Enters a notif-disabled critical section (nested). A no-op in vcore
/// context (already masked) and on plain host threads (nothing to mask).
pub fn uth_disable_notifs() {
    if in_vcore_context() {
        return;
    }
    let Some(uth) = current_uthread() else { return };
    if uth.notif_disabled_depth.fetch_add(1, Ordering::AcqRel) == 0 {
        // Pin first so the vcoreid we mask is the one we run on.
        uth.set_flag(UthreadFlags::DONT_MIGRATE);
        cmb();
        let rt = vcore::current_rt().expect("no runtime");
        rt.proc()
            .procdata()
            .vcpd(vcore_id())
            .set_notif_disabled(true);
    }
}

/// Leaves a notif-disabled critical section; takes any notification
/// that arrived while masked.
pub fn uth_enable_notifs() {
    if in_vcore_context() {
        return;
    }
    let Some(uth) = current_uthread() else { return };
    if uth.notif_disabled_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
        let rt = vcore::current_rt().expect("no runtime");
        let vcpd = rt.proc().procdata().vcpd(vcore_id());
        uth.clear_flag(UthreadFlags::DONT_MIGRATE);
        vcpd.set_notif_disabled(false);
        wrmb();
        if vcpd.notif_pending() {
            vcore::poll_interrupts();
        }
    }
}

/// Issues a blocking wait on a submitted syscall: yields through the
/// 2LS until the kernel marks it done. `SC_PROGRESS` wakeups re-sleep.
pub fn block_on_syscall(sysc: &Arc<Syscall>) {
    let rt = vcore::current_rt().expect("no runtime");
    while !sysc.done() {
        let rt2 = rt.clone();
        let sysc2 = sysc.clone();
        uthread_yield(true, move |uth| {
            *uth.sysc.lock() = Some(sysc2.clone());
            rt2.ops().thread_blockon_sysc(&rt2, uth, &sysc2);
        });
        // Woken: either done, or a PROGRESS hint; loop decides.
    }
    if let Some(uth) = current_uthread() {
        *uth.sysc.lock() = None;
    }
}

/// Transitions the calling process from SCP to MCP with `nr_vcores`
/// vcores. Called on a uthread (usually the program's main thread); the
/// caller's context becomes vcore 0's interrupted uthread and resumes
/// once the allocator grants the first many-core vcore.
pub fn change_to_mcp(rt: &Arc<UserRuntime>, nr_vcores: u32) -> Result<(), corral_abi::Errno> {
    assert!(!in_vcore_context(), "change_to_m from vcore context");
    let uth = current_uthread().expect("no uthread");
    let proc = rt.proc().clone();
    let vcoreid = vcore_id();
    let vcpd = proc.procdata().vcpd(vcoreid);

    // Save ourselves as vcore 0's interrupted uthread before the flip;
    // the first vcore entry in M mode restarts us.
    uth.save_to_notif_slot(&proc, vcoreid);
    vcpd.set_notif_disabled(true);
    if let Err(e) = rt.machine().sys_change_to_m(&proc, nr_vcores) {
        // Undo the save; we are still a plain SCP uthread.
        let _ = proc.procdata().vcpd(vcoreid).take_uthread_ctx();
        uth.clear_flag(UthreadFlags::SAVED | UthreadFlags::FPSAVED);
        vcpd.set_notif_disabled(false);
        return Err(e);
    }
    // Hand the management core back; the kernel regrants CG cores.
    uth.suspend(SuspendMsg::CoreDetached(corral_abi::ctx::VcoreRet::CoreYielded));
    Ok(())
}

/// Adjusts how many cores the process wants and pokes the allocator.
pub fn vcore_request(rt: &Arc<UserRuntime>, nr_vcores: u32) {
    rt.proc()
        .procdata()
        .set_res_desire(corral_abi::RES_CORES, nr_vcores);
    rt.machine().run_scheduler();
}

impl UserRuntime {
    /// Pops a runnable uthread chosen by the 2LS onto this vcore.
    pub(crate) fn run_uthread_on(&self, vcoreid: u32, uth: &Arc<Uthread>) {
        let flags = uth.flags();
        assert!(!flags.contains(UthreadFlags::DEAD), "running a dead uthread");
        if flags.contains(UthreadFlags::DONT_MIGRATE) {
            assert_eq!(
                uth.last_vcore(),
                vcoreid,
                "DONT_MIGRATE uthread popped on a different vcore"
            );
        }
        let Some(ctx) = uth.take_saved_ctx() else {
            panic!("running a uthread with no saved context");
        };
        self.run_popped(vcoreid, uth, ctx);
    }

    /// Pops `ctx` as `uth` on this vcore and services whatever suspends
    /// it. The `notif_disabled` clear is atomic with the restore: a
    /// pending notification aborts the pop and re-enters vcore entry.
    pub(crate) fn run_popped(&self, vcoreid: u32, uth: &Arc<Uthread>, ctx: UserContext) {
        let proc = self.proc().clone();
        let vcpd = proc.procdata().vcpd(vcoreid);
        *self.vcore_local(vcoreid).current_uthread.lock() = Some(uth.clone());

        if uth.notif_disabled_depth() == 0 {
            vcpd.set_notif_disabled(false);
            wrmb();
            if vcpd.notif_pending() {
                // A notification beat the restore; retry from the top.
                vcpd.set_notif_disabled(true);
                vcpd.save_uthread_ctx(ctx);
                uth.set_flag(UthreadFlags::SAVED);
                return;
            }
        }

        let mut msg = ctx.pop(vcoreid);
        loop {
            // Back in vcore context.
            match msg {
                SuspendMsg::Yielded => {
                    self.clear_current(vcoreid);
                    let cb = uth.take_pending_yield();
                    if let Some(cb) = cb {
                        cb(uth);
                    }
                    return;
                }
                SuspendMsg::Exited => {
                    // A naturally-returning body never re-masked
                    // notifications; vcore context requires them masked.
                    vcpd.set_notif_disabled(true);
                    self.clear_current(vcoreid);
                    return;
                }
                SuspendMsg::Notified => {
                    // Context is parked in the notif slot; entry re-runs.
                    return;
                }
                SuspendMsg::Preempted => {
                    // Context parked in the notif slot; give the core
                    // back and restart fresh later.
                    self.machine().preempt_ack(&proc, vcoreid, false);
                    self.machine().preempt_park(&proc, vcoreid, false);
                    return;
                }
                SuspendMsg::CoreFrozen(ret) => {
                    // The uthread handed the whole core away while
                    // frozen; when we get a core back, resume it.
                    self.machine().vcore_handoff(&proc, vcoreid, ret);
                    msg = ctx.pop(vcoreid);
                }
                SuspendMsg::CoreDetached(ret) => {
                    // Context saved to shared state; fresh entry next.
                    self.machine().vcore_handoff(&proc, vcoreid, ret);
                    return;
                }
            }
        }
    }

    fn clear_current(&self, vcoreid: u32) {
        *self.vcore_local(vcoreid).current_uthread.lock() = None;
    }

    /// Takes the vcore's interrupted uthread, if its context is parked
    /// in the notif slot. Used by preemption recovery on other vcores.
    pub fn steal_interrupted(&self, rem_vcoreid: u32) -> Option<(Arc<Uthread>, UserContext)> {
        let ctx = self.proc().procdata().vcpd(rem_vcoreid).take_uthread_ctx()?;
        let uth = self
            .vcore_local(rem_vcoreid)
            .current_uthread
            .lock()
            .take()
            .expect("notif-slot context without an owner");
        Some((uth, ctx))
    }
}
