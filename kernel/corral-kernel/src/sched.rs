//! The core allocator.
//!
//! Tracks which process owns and which process is provisioned each CG
//! pcore, keeps the idle-core queue, and runs the allocation pass that
//! hands cores to processes that want more. Provisioning is a
//! preference, not a guarantee: a provisioned core allocated elsewhere
//! is only revoked when cores are scarce.
//!
//! The allocation pass is driven through a [`PokeTracker`]: any number
//! of wakeups, yields, and desire changes coalesce into at most one
//! in-flight pass plus one follow-up.

use std::collections::{BTreeMap, VecDeque};

use corral_abi::RES_CORES;
use corral_core::{PokeTracker, SpinLock};

use crate::{Machine, PREEMPT_WARN_USEC};

/// Per-pcore allocation record.
struct PcoreAlloc {
    is_ll: bool,
    /// Current owner, if granted.
    alloc_pid: Option<u32>,
    /// Provisioning preference, if any.
    prov_pid: Option<u32>,
}

/// Per-process provisioning lists, split by whether the provisioned
/// core is currently allocated to that process.
#[derive(Default)]
struct CoreRequestData {
    prov_alloc_me: Vec<u32>,
    prov_not_alloc_me: Vec<u32>,
}

/// Allocator state under one lock.
struct SchedState {
    pcores: Vec<PcoreAlloc>,
    /// CG cores owned by nobody. Pushed at the head on dealloc (LIFO
    /// recycling keeps caches warm).
    idlecores: VecDeque<u32>,
    /// LL cores with no SCP on them.
    idle_ll: VecDeque<u32>,
    /// SCPs waiting for a management core.
    runnable_scps: VecDeque<u32>,
    /// All registered processes' provisioning lists.
    crd: BTreeMap<u32, CoreRequestData>,
    /// Registered MCPs, in registration order.
    mcps: Vec<u32>,
}

/// The kernel scheduler.
pub(crate) struct Ksched {
    state: SpinLock<SchedState>,
    poke: PokeTracker,
}

/// A grant decision computed under the lock, executed outside it.
struct Grant {
    pid: u32,
    pcoreid: u32,
    scp: bool,
}

impl Ksched {
    pub(crate) fn new(nr_pcores: u32, nr_ll: u32) -> Self {
        let pcores = (0..nr_pcores)
            .map(|id| PcoreAlloc {
                is_ll: id < nr_ll,
                alloc_pid: None,
                prov_pid: None,
            })
            .collect();
        Self {
            state: SpinLock::new(SchedState {
                pcores,
                idlecores: (nr_ll..nr_pcores).collect(),
                idle_ll: (0..nr_ll).collect(),
                runnable_scps: VecDeque::new(),
                crd: BTreeMap::new(),
                mcps: Vec::new(),
            }),
            poke: PokeTracker::new(),
        }
    }

    /// Tells the ksched about a new process (tracked cradle-to-grave).
    pub(crate) fn proc_register(&self, pid: u32) {
        self.state.lock().crd.entry(pid).or_default();
    }

    /// The proc was an SCP and is becoming an MCP.
    pub(crate) fn proc_change_to_m(&self, pid: u32) {
        let mut st = self.state.lock();
        st.runnable_scps.retain(|&p| p != pid);
        if !st.mcps.contains(&pid) {
            st.mcps.push(pid);
        }
    }

    /// Makes a runnable SCP eligible for a management core.
    pub(crate) fn scp_runnable(&self, pid: u32) {
        let mut st = self.state.lock();
        if !st.runnable_scps.contains(&pid) {
            st.runnable_scps.push_back(pid);
        }
    }

    /// Records that a pcore came back from a process.
    pub(crate) fn core_returned(&self, pcoreid: u32, pid: u32) {
        let mut st = self.state.lock();
        let entry = &mut st.pcores[pcoreid as usize];
        debug_assert_eq!(entry.alloc_pid, Some(pid), "core returned by non-owner");
        entry.alloc_pid = None;
        let is_ll = entry.is_ll;
        let prov = entry.prov_pid;
        if let Some(prov_pid) = prov {
            move_prov_sublist(&mut st, prov_pid, pcoreid, false);
        }
        if is_ll {
            st.idle_ll.push_front(pcoreid);
        } else {
            st.idlecores.push_front(pcoreid);
        }
    }

    /// Provisioning: record the preference, yanking the core from any
    /// previous provisionee's lists first.
    pub(crate) fn provision_core(&self, pid: u32, pcoreid: u32) -> Result<(), ()> {
        let mut st = self.state.lock();
        if st.pcores[pcoreid as usize].is_ll {
            return Err(());
        }
        if let Some(old) = st.pcores[pcoreid as usize].prov_pid {
            remove_from_prov_lists(&mut st, old, pcoreid);
        }
        st.pcores[pcoreid as usize].prov_pid = Some(pid);
        let allocated_to_me = st.pcores[pcoreid as usize].alloc_pid == Some(pid);
        let crd = st.crd.entry(pid).or_default();
        if allocated_to_me {
            crd.prov_alloc_me.push(pcoreid);
        } else {
            crd.prov_not_alloc_me.push(pcoreid);
        }
        Ok(())
    }

    /// The proc is dying: forget it everywhere. The caller is
    /// responsible for the cores still out (they come back through
    /// [`core_returned`](Self::core_returned) as vcores unwind).
    pub(crate) fn proc_destroy_cleanup(&self, pid: u32) {
        let mut st = self.state.lock();
        st.runnable_scps.retain(|&p| p != pid);
        st.mcps.retain(|&p| p != pid);
        st.crd.remove(&pid);
        for pc in &mut st.pcores {
            if pc.prov_pid == Some(pid) {
                pc.prov_pid = None;
            }
        }
    }

    /// Which process owns a pcore, if any.
    pub(crate) fn alloc_pid_of(&self, pcoreid: u32) -> Option<u32> {
        self.state.lock().pcores[pcoreid as usize].alloc_pid
    }

    /// Which process a pcore is provisioned to, if any.
    pub(crate) fn prov_pid_of(&self, pcoreid: u32) -> Option<u32> {
        self.state.lock().pcores[pcoreid as usize].prov_pid
    }

    /// Runs (or coalesces into) an allocation pass.
    pub(crate) fn poke(&self, machine: &Machine) {
        self.poke.poke(|| self.schedule_once(machine));
    }

    /// One allocation pass: SCPs onto LL cores, then MCP core grants,
    /// then revocation of over-provisioned cores if still scarce.
    fn schedule_once(&self, machine: &Machine) {
        let mut grants: Vec<Grant> = Vec::new();
        let mut revoke: Vec<u32> = Vec::new();
        {
            let mut st = self.state.lock();

            // SCPs first: they only need a management core.
            while let Some(&ll) = st.idle_ll.front() {
                let Some(pid) = st.runnable_scps.pop_front() else {
                    break;
                };
                let Some(proc) = machine.lookup_proc(pid) else {
                    continue;
                };
                if proc.dying() {
                    continue;
                }
                st.idle_ll.pop_front();
                st.pcores[ll as usize].alloc_pid = Some(pid);
                grants.push(Grant { pid, pcoreid: ll, scp: true });
            }

            // MCPs: satisfy desires from provisioned-idle, then idle.
            let mcps = st.mcps.clone();
            for pid in mcps {
                let Some(proc) = machine.lookup_proc(pid) else {
                    continue;
                };
                if proc.dying() || !proc.state().is_mcp() {
                    continue;
                }
                // A woken MCP gets at least one core to drain events
                // with, whatever its posted desires say.
                let mut wants = proc.procdata().res_desire(RES_CORES) as usize;
                if proc.state() == crate::proc::ProcState::RunnableM {
                    wants = wants.max(1);
                }
                let mut have = st
                    .pcores
                    .iter()
                    .filter(|pc| pc.alloc_pid == Some(pid))
                    .count()
                    + grants.iter().filter(|g| g.pid == pid).count();
                while have < wants {
                    // Prefer our provisioned-but-idle cores.
                    let prov_idle = st
                        .crd
                        .get(&pid)
                        .and_then(|crd| {
                            crd.prov_not_alloc_me
                                .iter()
                                .copied()
                                .find(|&pc| st.pcores[pc as usize].alloc_pid.is_none())
                        });
                    let pcoreid = match prov_idle {
                        Some(pc) => {
                            st.idlecores.retain(|&c| c != pc);
                            pc
                        }
                        None => match st.idlecores.pop_front() {
                            Some(pc) => pc,
                            None => break,
                        },
                    };
                    st.pcores[pcoreid as usize].alloc_pid = Some(pid);
                    if st.pcores[pcoreid as usize].prov_pid == Some(pid) {
                        move_prov_sublist(&mut st, pid, pcoreid, true);
                    }
                    grants.push(Grant { pid, pcoreid, scp: false });
                    have += 1;
                }
                if have < wants {
                    // Scarce: pull back our provisioned cores held by
                    // processes running beyond their own provision.
                    if let Some(crd) = st.crd.get(&pid) {
                        for &pc in &crd.prov_not_alloc_me {
                            match st.pcores[pc as usize].alloc_pid {
                                Some(h) if h != pid => revoke.push(pc),
                                _ => {}
                            }
                        }
                    }
                }
            }
        }
        for g in grants {
            machine.execute_grant(g.pid, g.pcoreid, g.scp);
        }
        for pc in revoke {
            machine.preempt_core_deadline(pc, PREEMPT_WARN_USEC);
        }
    }
}

/// Moves `pcoreid` between the provisionee's alloc/not-alloc sublists.
fn move_prov_sublist(st: &mut SchedState, pid: u32, pcoreid: u32, now_allocated: bool) {
    let crd = st.crd.entry(pid).or_default();
    if now_allocated {
        crd.prov_not_alloc_me.retain(|&pc| pc != pcoreid);
        if !crd.prov_alloc_me.contains(&pcoreid) {
            crd.prov_alloc_me.push(pcoreid);
        }
    } else {
        crd.prov_alloc_me.retain(|&pc| pc != pcoreid);
        if !crd.prov_not_alloc_me.contains(&pcoreid) {
            crd.prov_not_alloc_me.push(pcoreid);
        }
    }
}

/// Removes `pcoreid` from both of `pid`'s provisioning sublists.
fn remove_from_prov_lists(st: &mut SchedState, pid: u32, pcoreid: u32) {
    if let Some(crd) = st.crd.get_mut(&pid) {
        crd.prov_alloc_me.retain(|&pc| pc != pcoreid);
        crd.prov_not_alloc_me.retain(|&pc| pc != pcoreid);
    }
}

/// Checks the destroy postcondition: `pid` is in no provisioning list
/// and owns no pcore. Test support.
pub(crate) fn assert_proc_gone(ksched: &Ksched, pid: u32) -> bool {
    let st = ksched.state.lock();
    let owns = st.pcores.iter().any(|pc| pc.alloc_pid == Some(pid));
    let prov = st.pcores.iter().any(|pc| pc.prov_pid == Some(pid));
    let listed = st.crd.contains_key(&pid)
        || st.mcps.contains(&pid)
        || st.runnable_scps.contains(&pid);
    !owns && !prov && !listed
}
