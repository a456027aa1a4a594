//! Syscall dispatch and the slow-call registry.
//!
//! [`Machine::submit`] is the trap: it runs the handler on the calling
//! thread. Fast calls set `SC_DONE` before returning; slow calls
//! (`BLOCK`, an empty-channel `CHAN_READ`) park in the pending registry
//! and complete from the alarm device or a writer, posting `EV_SYSCALL`
//! to the registered ev_q. A syscall's identity is the address of its
//! shared record; completion events carry it in `ev_arg3`.

use std::sync::Arc;

use corral_abi::event::{EV_SYSCALL, EventMsg};
use corral_abi::syscall::nr;
use corral_abi::{Errno, Syscall};
use corral_core::SpinLock;
use corral_core::time::{read_tsc, usec2tsc};

use crate::Machine;
use crate::alarm::AlarmAction;
use crate::chan::ChanReader;
use crate::percpu;
use crate::proc::Proc;

/// The identity word of a syscall record.
pub fn sysc_addr(sysc: &Arc<Syscall>) -> u64 {
    Arc::as_ptr(sysc) as u64
}

/// Why a syscall is parked in the kernel.
pub(crate) enum PendingKind {
    /// Sleeping in `sys_block`; the alarm device completes it.
    Block,
    /// Blocked reading an empty channel.
    ChanRead { chan: u64 },
}

pub(crate) struct PendingSysc {
    pub(crate) addr: u64,
    pub(crate) sysc: Arc<Syscall>,
    pub(crate) pid: u32,
    pub(crate) kind: PendingKind,
}

/// Registry of kernel-parked syscalls. Removal is the completion/abort
/// exclusion point: whoever takes the entry owns completing it.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: SpinLock<Vec<PendingSysc>>,
}

impl PendingTable {
    pub(crate) fn insert(&self, entry: PendingSysc) {
        self.entries.lock().push(entry);
    }

    pub(crate) fn take(&self, addr: u64) -> Option<PendingSysc> {
        let mut entries = self.entries.lock();
        let idx = entries.iter().position(|e| e.addr == addr)?;
        Some(entries.swap_remove(idx))
    }

    pub(crate) fn take_all_for_pid(&self, pid: u32) -> Vec<PendingSysc> {
        let mut entries = self.entries.lock();
        let mut out = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            if entries[i].pid == pid {
                out.push(entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        out
    }
}

impl Machine {
    /// The syscall trap: dispatches by number on the calling thread.
    ///
    /// On return the syscall is either done (`SC_DONE`) or parked in the
    /// kernel; the caller decides whether to spin, block a uthread, or
    /// keep running.
    pub fn submit(&self, proc: &Arc<Proc>, sysc: &Arc<Syscall>) {
        match sysc.num {
            nr::PROC_YIELD => {
                let vcoreid = percpu::current_vcoreid();
                match self.sys_proc_yield(proc, vcoreid, sysc.args[0] != 0) {
                    Ok(yielded) => self.complete_and_post(proc, sysc, i64::from(yielded), None, ""),
                    Err(e) => self.complete_and_post(proc, sysc, -1, Some(e), "yield refused"),
                }
            }
            nr::CHANGE_VCORE => {
                // Vcore-context semantics: bookkeeping, then the caller's
                // pcore moves to the target and we park until restarted.
                let vcoreid = percpu::current_vcoreid();
                #[expect(clippy::cast_possible_truncation, reason = "vcoreid argument")]
                let target = sysc.args[0] as u32;
                let enable_my_notif = sysc.args[1] != 0;
                match self.sys_change_vcore(proc, vcoreid, target, enable_my_notif) {
                    Ok(()) => {
                        self.vcore_handoff(
                            proc,
                            vcoreid,
                            corral_abi::ctx::VcoreRet::ChangeTo { target, enable_my_notif },
                        );
                        self.complete_and_post(proc, sysc, 0, None, "");
                    }
                    Err(e) => self.complete_and_post(proc, sysc, -1, Some(e), "target not restartable"),
                }
            }
            nr::CHANGE_TO_M => {
                #[expect(clippy::cast_possible_truncation, reason = "core count argument")]
                let nr_vcores = sysc.args[0] as u32;
                match self.sys_change_to_m(proc, nr_vcores) {
                    Ok(()) => self.complete_and_post(proc, sysc, 0, None, ""),
                    Err(e) => self.complete_and_post(proc, sysc, -1, Some(e), "not an SCP"),
                }
            }
            nr::GET_VCOREID => {
                let v = i64::from(percpu::current_vcoreid());
                self.complete_and_post(proc, sysc, v, None, "");
            }
            nr::SELF_NOTIFY => {
                #[expect(clippy::cast_possible_truncation, reason = "packed event args")]
                {
                    let vcoreid = sysc.args[0] as u32;
                    if vcoreid >= proc.procinfo().max_vcores() {
                        self.complete_and_post(proc, sysc, -1, Some(Errno::EINVAL), "bad vcoreid");
                        return;
                    }
                    let msg = EventMsg {
                        ev_type: sysc.args[1] as u16,
                        ev_arg1: 0,
                        ev_arg2: sysc.args[2] as u32,
                        ev_arg3: sysc.args[3],
                        ev_arg4: 0,
                    };
                    proc.procdata().vcpd(vcoreid).ev_mbox_public().post(&msg);
                    if sysc.args[4] != 0 {
                        self.notify_vcore(proc, vcoreid);
                    }
                }
                self.complete_and_post(proc, sysc, 0, None, "");
            }
            nr::NOTIFY => {
                #[expect(clippy::cast_possible_truncation, reason = "packed event args")]
                {
                    let pid = sysc.args[0] as u32;
                    match self.lookup_proc(pid) {
                        Some(target) => {
                            let msg = EventMsg {
                                ev_type: sysc.args[1] as u16,
                                ev_arg1: 0,
                                ev_arg2: sysc.args[2] as u32,
                                ev_arg3: sysc.args[3],
                                ev_arg4: 0,
                            };
                            self.send_kernel_event(&target, &msg, 0);
                            self.complete_and_post(proc, sysc, 0, None, "");
                        }
                        None => {
                            self.complete_and_post(proc, sysc, -1, Some(Errno::ESRCH), "no such pid");
                        }
                    }
                }
            }
            nr::BLOCK => {
                if sysc.abort_requested() {
                    self.complete_and_post(proc, sysc, -1, Some(Errno::EINTR), "aborted");
                    return;
                }
                let addr = sysc_addr(sysc);
                self.inner().pending.insert(PendingSysc {
                    addr,
                    sysc: sysc.clone(),
                    pid: proc.pid(),
                    kind: PendingKind::Block,
                });
                let deadline = read_tsc() + usec2tsc(sysc.args[0]);
                self.inner()
                    .alarm
                    .arm(deadline, AlarmAction::SyscTimeout { addr });
            }
            nr::CHAN_READ => {
                let addr = sysc_addr(sysc);
                if sysc.abort_requested() {
                    self.complete_and_post(proc, sysc, -1, Some(Errno::EINTR), "aborted");
                    return;
                }
                let Some(chan) = self.inner().chans.get(sysc.args[0]) else {
                    self.complete_and_post(proc, sysc, -1, Some(Errno::ENOENT), "no such channel");
                    return;
                };
                #[expect(clippy::cast_possible_truncation, reason = "read size argument")]
                let nbytes = sysc.args[1] as usize;
                // Park first, then try the fast path, so a concurrent
                // writer always finds either data or our registry entry.
                self.inner().pending.insert(PendingSysc {
                    addr,
                    sysc: sysc.clone(),
                    pid: proc.pid(),
                    kind: PendingKind::ChanRead { chan: sysc.args[0] },
                });
                if let Some(bytes) = chan.read_or_enqueue(ChanReader { addr, nbytes }) {
                    if let Some(entry) = self.inner().pending.take(addr) {
                        #[expect(clippy::cast_possible_wrap, reason = "byte count")]
                        let len = bytes.len() as i64;
                        entry.sysc.set_data(bytes);
                        self.complete_and_post(proc, &entry.sysc, len, None, "");
                    }
                }
            }
            nr::CHAN_WRITE => {
                let Some(chan) = self.inner().chans.get(sysc.args[0]) else {
                    self.complete_and_post(proc, sysc, -1, Some(Errno::ENOENT), "no such channel");
                    return;
                };
                let data = sysc.take_data();
                #[expect(clippy::cast_possible_wrap, reason = "byte count")]
                let len = data.len() as i64;
                for (raddr, bytes) in chan.write(&data) {
                    let Some(entry) = self.inner().pending.take(raddr) else {
                        // The reader was aborted between dequeue and
                        // completion; its bytes go back to the channel.
                        chan.unread(&bytes);
                        continue;
                    };
                    let Some(reader_proc) = self.lookup_proc(entry.pid) else {
                        chan.unread(&bytes);
                        continue;
                    };
                    #[expect(clippy::cast_possible_wrap, reason = "byte count")]
                    let rlen = bytes.len() as i64;
                    entry.sysc.set_data(bytes);
                    self.complete_and_post(&reader_proc, &entry.sysc, rlen, None, "");
                }
                self.complete_and_post(proc, sysc, len, None, "");
            }
            nr::ABORT_SYSC => {
                let hit = self.abort_sysc_addr(sysc.args[0]);
                self.complete_and_post(proc, sysc, i64::from(hit), None, "");
            }
            nr::POKE_KSCHED => {
                self.run_scheduler();
                self.complete_and_post(proc, sysc, 0, None, "");
            }
            nr::PROVISION => {
                #[expect(clippy::cast_possible_truncation, reason = "id arguments")]
                let (pid, pcoreid) = (sysc.args[0] as u32, sysc.args[2] as u32);
                let res = self
                    .inner()
                    .sched
                    .provision_core(pid, pcoreid)
                    .map_err(|()| Errno::EINVAL);
                match res {
                    Ok(()) => {
                        self.run_scheduler();
                        self.complete_and_post(proc, sysc, 0, None, "");
                    }
                    Err(e) => self.complete_and_post(proc, sysc, -1, Some(e), "not a CG core"),
                }
            }
            nr::PROC_DESTROY => {
                #[expect(clippy::cast_possible_truncation, reason = "pid argument")]
                let pid = sysc.args[0] as u32;
                match self.lookup_proc(pid) {
                    Some(victim) => {
                        #[expect(clippy::cast_possible_wrap, reason = "status argument")]
                        self.destroy_proc(&victim, sysc.args[1] as i64);
                        self.complete_and_post(proc, sysc, 0, None, "");
                    }
                    None => {
                        self.complete_and_post(proc, sysc, -1, Some(Errno::ESRCH), "no such pid");
                    }
                }
            }
            nr::ALARM_CLONE => {
                let id = self.inner().alarm.clone_alarm(proc.pid());
                self.complete_and_post(proc, sysc, i64::from(id), None, "");
            }
            nr::ALARM_CTL_READ => {
                #[expect(clippy::cast_possible_truncation, reason = "alarm id argument")]
                let id = sysc.args[0] as u32;
                match self.inner().alarm.ctl_read(id) {
                    Some(text) => {
                        sysc.set_data(text.into_bytes());
                        self.complete_and_post(proc, sysc, i64::from(id), None, "");
                    }
                    None => self.complete_and_post(proc, sysc, -1, Some(Errno::ENOENT), "no such alarm"),
                }
            }
            nr::ALARM_TIMER_WRITE => {
                #[expect(clippy::cast_possible_truncation, reason = "alarm id argument")]
                let id = sysc.args[0] as u32;
                let text = String::from_utf8(sysc.take_data()).unwrap_or_default();
                match self.inner().alarm.timer_write(id, &text) {
                    Ok(()) => self.complete_and_post(proc, sysc, 0, None, ""),
                    Err(()) => {
                        self.complete_and_post(proc, sysc, -1, Some(Errno::EINVAL), "bad deadline")
                    }
                }
            }
            nr::ALARM_EVQCTL_WRITE => {
                #[expect(clippy::cast_possible_truncation, reason = "alarm id argument")]
                let id = sysc.args[0] as u32;
                let text = String::from_utf8(sysc.take_data()).unwrap_or_default();
                match self.inner().alarm.evqctl_write(id, &text) {
                    Ok(()) => self.complete_and_post(proc, sysc, 0, None, ""),
                    Err(()) => {
                        self.complete_and_post(proc, sysc, -1, Some(Errno::EINVAL), "bad ev_q binding")
                    }
                }
            }
            nr::ALARM_CLOSE => {
                #[expect(clippy::cast_possible_truncation, reason = "alarm id argument")]
                let id = sysc.args[0] as u32;
                self.inner().alarm.close_alarm(id);
                self.complete_and_post(proc, sysc, 0, None, "");
            }
            _ => {
                self.complete_and_post(proc, sysc, -1, Some(Errno::ENOSYS), "unknown syscall");
            }
        }
    }

    /// Completes a syscall and posts the completion event if user-mode
    /// registered for one.
    pub(crate) fn complete_and_post(
        &self,
        proc: &Arc<Proc>,
        sysc: &Arc<Syscall>,
        retval: i64,
        err: Option<Errno>,
        errstr: &str,
    ) {
        if let Some(evq) = sysc.complete(retval, err, errstr) {
            let msg = EventMsg {
                ev_type: EV_SYSCALL,
                ev_arg1: 0,
                ev_arg2: 0,
                ev_arg3: sysc_addr(sysc),
                ev_arg4: 0,
            };
            self.send_event(proc, evq, &msg);
        }
    }

    /// Aborts a kernel-parked syscall by identity. The syscall still
    /// completes (with `EINTR`); abort is cancellation, not teardown.
    pub fn abort_sysc(&self, sysc: &Arc<Syscall>) -> bool {
        sysc.request_abort();
        self.abort_sysc_addr(sysc_addr(sysc))
    }

    fn abort_sysc_addr(&self, addr: u64) -> bool {
        let Some(entry) = self.inner().pending.take(addr) else {
            return false;
        };
        entry.sysc.request_abort();
        if let PendingKind::ChanRead { chan } = entry.kind {
            if let Some(chan) = self.inner().chans.get(chan) {
                chan.cancel_reader(addr);
            }
        }
        let Some(proc) = self.lookup_proc(entry.pid) else {
            return true;
        };
        log::debug!("pid {}: syscall {:#x} aborted", entry.pid, addr);
        self.complete_and_post(&proc, &entry.sysc, -1, Some(Errno::EINTR), "aborted");
        true
    }

    /// Alarm-device path: a `sys_block` deadline passed.
    pub(crate) fn complete_block_timeout(&self, addr: u64) {
        let Some(entry) = self.inner().pending.take(addr) else {
            return; // abort won
        };
        let Some(proc) = self.lookup_proc(entry.pid) else {
            return;
        };
        self.complete_and_post(&proc, &entry.sysc, 0, None, "");
    }

    /// Alarm-device path: a posted revocation warning expired.
    pub(crate) fn enforce_preempt_deadline(&self, pcoreid: u32) {
        let Some((proc, vcoreid)) = self.vcore_on_pcore(pcoreid) else {
            return;
        };
        match proc.procinfo().vcoremap(vcoreid).preempt_pending() {
            Some(deadline) if deadline <= read_tsc() => {
                self.preempt_core(pcoreid);
            }
            _ => {}
        }
    }

    /// Arms the hard-revoke action behind a posted warning.
    pub(crate) fn arm_preempt_deadline(&self, pcoreid: u32, deadline_tsc: u64) {
        self.inner()
            .alarm
            .arm(deadline_tsc, AlarmAction::PreemptDeadline { pcoreid });
    }
}
