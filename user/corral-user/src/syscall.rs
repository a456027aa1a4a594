//! User-side syscall issue.
//!
//! Builds the shared record, submits it, and (when the kernel left it
//! in flight) multiplexes the wait through the 2LS: in uthread context
//! the caller sleeps on the completion event, in vcore context it spins
//! at interrupt points. Plus typed wrappers for the calls the runtime
//! and tests use, including the alarm device's file-style surface.

use std::sync::Arc;

use corral_abi::syscall::nr;
use corral_abi::{Errno, Syscall};

use crate::UserRuntime;
use crate::uthread::block_on_syscall;
use crate::vcore::{cpu_relax_vc, in_vcore_context};

/// Builds and submits a syscall, then waits for completion the way the
/// calling context allows. Returns the completed record.
pub fn ros_syscall(rt: &Arc<UserRuntime>, num: u32, args: [u64; 6]) -> Arc<Syscall> {
    let sysc = submit_raw(rt, num, args);
    wait_syscall(rt, &sysc);
    sysc
}

/// Submits without waiting. The caller owns checking `done`.
pub fn submit_raw(rt: &Arc<UserRuntime>, num: u32, args: [u64; 6]) -> Arc<Syscall> {
    let sysc = Arc::new(Syscall::new(num, args));
    rt.machine().submit(rt.proc(), &sysc);
    sysc
}

/// Waits for a submitted syscall to complete.
pub fn wait_syscall(rt: &Arc<UserRuntime>, sysc: &Arc<Syscall>) {
    let _ = rt;
    if sysc.done() {
        return;
    }
    if in_vcore_context() {
        while !sysc.done() {
            cpu_relax_vc();
        }
    } else {
        block_on_syscall(sysc);
    }
}

fn retval_or_err(sysc: &Arc<Syscall>) -> Result<i64, Errno> {
    match sysc.err() {
        Some(e) => Err(e),
        None => Ok(sysc.retval()),
    }
}

/// Sleeps for `usec` microseconds through the kernel (slow syscall).
pub fn sys_block(rt: &Arc<UserRuntime>, usec: u64) -> Result<(), Errno> {
    let sysc = ros_syscall(rt, nr::BLOCK, [usec, 0, 0, 0, 0, 0]);
    retval_or_err(&sysc).map(|_| ())
}

/// Reads up to `nbytes` from a kernel byte channel, blocking while it
/// is empty.
pub fn sys_chan_read(rt: &Arc<UserRuntime>, chan: u64, nbytes: usize) -> Result<Vec<u8>, Errno> {
    let sysc = ros_syscall(rt, nr::CHAN_READ, [chan, nbytes as u64, 0, 0, 0, 0]);
    retval_or_err(&sysc)?;
    Ok(sysc.take_data())
}

/// Writes bytes to a kernel byte channel.
pub fn sys_chan_write(rt: &Arc<UserRuntime>, chan: u64, bytes: &[u8]) -> Result<usize, Errno> {
    let sysc = Arc::new(Syscall::new(nr::CHAN_WRITE, [chan, 0, 0, 0, 0, 0]));
    sysc.set_data(bytes.to_vec());
    rt.machine().submit(rt.proc(), &sysc);
    wait_syscall(rt, &sysc);
    let n = retval_or_err(&sysc)?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Asks the kernel which vcore the caller runs as.
pub fn sys_getvcoreid(rt: &Arc<UserRuntime>) -> u32 {
    let sysc = ros_syscall(rt, nr::GET_VCOREID, [0; 6]);
    u32::try_from(sysc.retval()).expect("kernel returned a bogus vcoreid")
}

/// Posts an event message to one of the caller's own vcores.
pub fn sys_self_notify(
    rt: &Arc<UserRuntime>,
    vcoreid: u32,
    ev_type: u16,
    arg2: u32,
    arg3: u64,
    ipi: bool,
) -> Result<(), Errno> {
    let sysc = ros_syscall(
        rt,
        nr::SELF_NOTIFY,
        [
            u64::from(vcoreid),
            u64::from(ev_type),
            u64::from(arg2),
            arg3,
            u64::from(ipi),
            0,
        ],
    );
    retval_or_err(&sysc).map(|_| ())
}

/// Posts an event message to another process's registered queue.
pub fn sys_notify(
    rt: &Arc<UserRuntime>,
    pid: u32,
    ev_type: u16,
    arg2: u32,
    arg3: u64,
) -> Result<(), Errno> {
    let sysc = ros_syscall(
        rt,
        nr::NOTIFY,
        [u64::from(pid), u64::from(ev_type), u64::from(arg2), arg3, 0, 0],
    );
    retval_or_err(&sysc).map(|_| ())
}

/// Requests many-core mode with `nr_vcores` vcores. Bookkeeping half;
/// see [`crate::uthread`] for the full transition.
pub fn sys_change_to_m_raw(rt: &Arc<UserRuntime>, nr_vcores: u32) -> Result<(), Errno> {
    rt.machine().sys_change_to_m(rt.proc(), nr_vcores)
}

/// Provisions a CG pcore to a process.
pub fn sys_provision(rt: &Arc<UserRuntime>, pid: u32, pcoreid: u32) -> Result<(), Errno> {
    let sysc = ros_syscall(
        rt,
        nr::PROVISION,
        [u64::from(pid), 0, u64::from(pcoreid), 0, 0, 0],
    );
    retval_or_err(&sysc).map(|_| ())
}

/// Asks the kernel to cancel a pending syscall.
pub fn sys_abort_sysc(rt: &Arc<UserRuntime>, target: &Arc<Syscall>) -> bool {
    rt.machine().abort_sysc(target)
}

// ── Alarm device files ───────────────────────────────────────────────

/// Opens `clone` on the alarm device; returns the new alarm's id.
pub fn devalarm_clone(rt: &Arc<UserRuntime>) -> Result<u32, Errno> {
    let sysc = ros_syscall(rt, nr::ALARM_CLONE, [0; 6]);
    let id = retval_or_err(&sysc)?;
    Ok(u32::try_from(id).expect("alarm device returned a bogus id"))
}

/// Reads the alarm's `ctl` file (its id, decimal).
pub fn devalarm_ctl_read(rt: &Arc<UserRuntime>, alarm_id: u32) -> Result<String, Errno> {
    let sysc = ros_syscall(rt, nr::ALARM_CTL_READ, [u64::from(alarm_id), 0, 0, 0, 0, 0]);
    retval_or_err(&sysc)?;
    Ok(String::from_utf8_lossy(&sysc.take_data()).into_owned())
}

/// Writes an absolute TSC deadline (decimal text) to the alarm's
/// `timer` file; `0` disarms.
pub fn devalarm_timer_write(
    rt: &Arc<UserRuntime>,
    alarm_id: u32,
    deadline_tsc: u64,
) -> Result<(), Errno> {
    let sysc = Arc::new(Syscall::new(
        nr::ALARM_TIMER_WRITE,
        [u64::from(alarm_id), 0, 0, 0, 0, 0],
    ));
    sysc.set_data(deadline_tsc.to_string().into_bytes());
    rt.machine().submit(rt.proc(), &sysc);
    wait_syscall(rt, &sysc);
    retval_or_err(&sysc).map(|_| ())
}

/// Binds an ev_q to the alarm via its `evq_ctl` file.
pub fn devalarm_evqctl_write(
    rt: &Arc<UserRuntime>,
    alarm_id: u32,
    evq: corral_abi::EvqId,
) -> Result<(), Errno> {
    let sysc = Arc::new(Syscall::new(
        nr::ALARM_EVQCTL_WRITE,
        [u64::from(alarm_id), 0, 0, 0, 0, 0],
    ));
    sysc.set_data(evq.encode().to_string().into_bytes());
    rt.machine().submit(rt.proc(), &sysc);
    wait_syscall(rt, &sysc);
    retval_or_err(&sysc).map(|_| ())
}

/// Closes the alarm trio, disarming it.
pub fn devalarm_close(rt: &Arc<UserRuntime>, alarm_id: u32) -> Result<(), Errno> {
    let sysc = ros_syscall(rt, nr::ALARM_CLOSE, [u64::from(alarm_id), 0, 0, 0, 0, 0]);
    retval_or_err(&sysc).map(|_| ())
}
