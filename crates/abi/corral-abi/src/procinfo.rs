//! The read-only process info region.
//!
//! The kernel publishes process identity and the vcore/pcore maps here;
//! user code reads them locklessly. Map updates are bracketed by
//! `coremap_seqctr`, so user-side reads must go through the seq-retry
//! accessors. By construction this module hands user code no mutable
//! access: the setters are for the kernel side of the boundary only and
//! must run inside a seq write section.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use corral_core::SeqCounter;
use corral_core::config::{MAX_PCORES, MAX_VCORES};

use crate::NR_RES;

/// Per-vcore map entry.
pub struct VcoreMapEntry {
    pcoreid: AtomicU32,
    valid: AtomicBool,
    nr_preempts_sent: AtomicU32,
    nr_preempts_done: AtomicU32,
    /// Advisory revocation deadline (absolute TSC; 0 = none).
    preempt_pending: AtomicU64,
    resume_ticks: AtomicU64,
    total_ticks: AtomicU64,
}

impl VcoreMapEntry {
    const fn new() -> Self {
        Self {
            pcoreid: AtomicU32::new(0),
            valid: AtomicBool::new(false),
            nr_preempts_sent: AtomicU32::new(0),
            nr_preempts_done: AtomicU32::new(0),
            preempt_pending: AtomicU64::new(0),
            resume_ticks: AtomicU64::new(0),
            total_ticks: AtomicU64::new(0),
        }
    }

    /// Physical core this vcore is bound to; meaningful while valid.
    pub fn pcoreid(&self) -> u32 {
        self.pcoreid.load(Ordering::Acquire)
    }

    /// Whether the vcore is mapped to a pcore.
    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Preempt messages sent to this vcore.
    pub fn nr_preempts_sent(&self) -> u32 {
        self.nr_preempts_sent.load(Ordering::Acquire)
    }

    /// Preempt messages fully serviced. Differs from
    /// [`nr_preempts_sent`](Self::nr_preempts_sent) iff a preempt is in
    /// flight.
    pub fn nr_preempts_done(&self) -> u32 {
        self.nr_preempts_done.load(Ordering::Acquire)
    }

    /// Whether the vcore was preempted and not yet restarted.
    pub fn preempted(&self) -> bool {
        self.nr_preempts_done() < self.nr_preempts_sent()
    }

    /// Advisory revocation deadline (absolute TSC), if one is posted.
    pub fn preempt_pending(&self) -> Option<u64> {
        match self.preempt_pending.load(Ordering::Acquire) {
            0 => None,
            t => Some(t),
        }
    }

    /// TSC of the last time this vcore started running.
    pub fn resume_ticks(&self) -> u64 {
        self.resume_ticks.load(Ordering::Acquire)
    }

    /// Accumulated online ticks.
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks.load(Ordering::Acquire)
    }

    // ── Kernel-side setters (inside a seq write section) ─────────────

    /// Binds the vcore to `pcoreid`.
    pub fn set_mapped(&self, pcoreid: u32) {
        self.pcoreid.store(pcoreid, Ordering::Release);
        self.valid.store(true, Ordering::Release);
        self.resume_ticks
            .store(corral_core::time::read_tsc(), Ordering::Release);
    }

    /// Unbinds the vcore, folding its online time into `total_ticks`.
    pub fn set_unmapped(&self) {
        let online = corral_core::time::read_tsc()
            .saturating_sub(self.resume_ticks.load(Ordering::Acquire));
        self.total_ticks.fetch_add(online, Ordering::AcqRel);
        self.valid.store(false, Ordering::Release);
    }

    /// Records that a preempt message was sent.
    pub fn inc_preempts_sent(&self) {
        self.nr_preempts_sent.fetch_add(1, Ordering::AcqRel);
    }

    /// Records that a preempt was fully serviced.
    pub fn inc_preempts_done(&self) {
        let done = self.nr_preempts_done.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(
            done <= self.nr_preempts_sent.load(Ordering::Acquire),
            "preempts_done ran ahead of preempts_sent"
        );
    }

    /// Posts or clears the advisory revocation deadline.
    pub fn set_preempt_pending(&self, deadline_tsc: u64) {
        self.preempt_pending.store(deadline_tsc, Ordering::Release);
    }
}

/// Per-pcore map entry (reverse mapping).
pub struct PcoreMapEntry {
    vcoreid: AtomicU32,
    valid: AtomicBool,
}

impl PcoreMapEntry {
    const fn new() -> Self {
        Self {
            vcoreid: AtomicU32::new(0),
            valid: AtomicBool::new(false),
        }
    }

    /// Vcore running on this pcore; meaningful while valid.
    pub fn vcoreid(&self) -> u32 {
        self.vcoreid.load(Ordering::Acquire)
    }

    /// Whether one of this process's vcores runs on the pcore.
    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Kernel-side: record the binding.
    pub fn set(&self, vcoreid: u32) {
        self.vcoreid.store(vcoreid, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    /// Kernel-side: clear the binding.
    pub fn clear(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

/// The process info region.
pub struct ProcInfo {
    pid: u32,
    ppid: u32,
    max_vcores: u32,
    tsc_freq: u64,
    is_mcp: AtomicBool,
    res_grant: [AtomicU32; NR_RES],
    num_vcores: AtomicU32,
    vcoremap: [VcoreMapEntry; MAX_VCORES],
    pcoremap: [PcoreMapEntry; MAX_PCORES],
    coremap_seqctr: SeqCounter,
}

impl ProcInfo {
    /// Builds the region for a fresh process.
    pub fn new(pid: u32, ppid: u32) -> Self {
        #[expect(clippy::cast_possible_truncation, reason = "config constant")]
        let max_vcores = MAX_VCORES as u32;
        Self {
            pid,
            ppid,
            max_vcores,
            tsc_freq: corral_core::time::TSC_FREQ,
            is_mcp: AtomicBool::new(false),
            res_grant: [const { AtomicU32::new(0) }; NR_RES],
            num_vcores: AtomicU32::new(0),
            vcoremap: [const { VcoreMapEntry::new() }; MAX_VCORES],
            pcoremap: [const { PcoreMapEntry::new() }; MAX_PCORES],
            coremap_seqctr: SeqCounter::new(),
        }
    }

    /// Process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Parent process id (0 for the first process).
    pub fn ppid(&self) -> u32 {
        self.ppid
    }

    /// Upper bound on vcores this process may hold.
    pub fn max_vcores(&self) -> u32 {
        self.max_vcores
    }

    /// Ticks per second of the TSC.
    pub fn tsc_freq(&self) -> u64 {
        self.tsc_freq
    }

    /// Whether the process is in many-core mode.
    pub fn is_mcp(&self) -> bool {
        self.is_mcp.load(Ordering::Acquire)
    }

    /// Kernel-side: flip into many-core mode.
    pub fn set_mcp(&self) {
        self.is_mcp.store(true, Ordering::Release);
    }

    /// Current grant for a resource class.
    pub fn res_grant(&self, res: usize) -> u32 {
        self.res_grant[res].load(Ordering::Acquire)
    }

    /// Kernel-side: publish a new grant.
    pub fn set_res_grant(&self, res: usize, amt: u32) {
        self.res_grant[res].store(amt, Ordering::Release);
    }

    /// Number of currently mapped vcores.
    pub fn num_vcores(&self) -> u32 {
        self.num_vcores.load(Ordering::Acquire)
    }

    /// Raw vcore map entry. Reads outside [`coremap_read`](Self::coremap_read)
    /// may be torn.
    pub fn vcoremap(&self, vcoreid: u32) -> &VcoreMapEntry {
        &self.vcoremap[vcoreid as usize]
    }

    /// Raw pcore map entry (reverse map).
    pub fn pcoremap(&self, pcoreid: u32) -> &PcoreMapEntry {
        &self.pcoremap[pcoreid as usize]
    }

    /// The coremap sequence counter.
    pub fn coremap_seqctr(&self) -> &SeqCounter {
        &self.coremap_seqctr
    }

    /// Runs `f` under the seq-retry loop, yielding a consistent
    /// point-in-time view of the maps.
    pub fn coremap_read<T>(&self, f: impl FnMut() -> T) -> T {
        self.coremap_seqctr.read_loop(f)
    }

    /// Kernel-side: runs `f` inside a seq write section. The caller must
    /// already hold whatever lock serializes map writers.
    pub fn coremap_write<T>(&self, f: impl FnOnce() -> T) -> T {
        self.coremap_seqctr.write_begin();
        let v = f();
        self.coremap_seqctr.write_end();
        v
    }

    /// Kernel-side: adjust the mapped-vcore count (inside a write section).
    pub fn set_num_vcores(&self, n: u32) {
        self.num_vcores.store(n, Ordering::Release);
    }

    /// Consistent snapshot: the pcore a vcore is mapped to, if any.
    pub fn vcore_pcoreid(&self, vcoreid: u32) -> Option<u32> {
        self.coremap_read(|| {
            let e = self.vcoremap(vcoreid);
            if e.valid() { Some(e.pcoreid()) } else { None }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_round_trip() {
        let pi = ProcInfo::new(1, 0);
        pi.coremap_write(|| {
            pi.vcoremap(2).set_mapped(5);
            pi.pcoremap(5).set(2);
            pi.set_num_vcores(1);
        });
        assert_eq!(pi.vcore_pcoreid(2), Some(5));
        assert_eq!(pi.pcoremap(5).vcoreid(), 2);
        pi.coremap_write(|| {
            pi.vcoremap(2).set_unmapped();
            pi.pcoremap(5).clear();
            pi.set_num_vcores(0);
        });
        assert_eq!(pi.vcore_pcoreid(2), None);
    }

    #[test]
    fn preempt_accounting_orders() {
        let pi = ProcInfo::new(1, 0);
        let e = pi.vcoremap(0);
        assert!(!e.preempted());
        e.inc_preempts_sent();
        assert!(e.preempted());
        e.inc_preempts_done();
        assert!(!e.preempted());
    }
}
