//! Many-core process scenarios: the SCP-to-MCP transition, parallel
//! uthreads over multiple vcores, synchronization primitives, and
//! preemption recovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use corral_core::time::{msec2tsc, read_tsc};
use corral_kernel::{Machine, MachineConfig};
use corral_threads::{Barrier, CondVar, Mutex, spawn, spawn_mcp};
use corral_user::spinlock::SpinPdr;
use corral_user::vcore::{cpu_relax_vc, vcore_id};

fn machine() -> Machine {
    Machine::bring_up(MachineConfig {
        nr_pcores: 8,
        nr_ll: 1,
    })
}

#[test]
fn mcp_transition_continues_main() {
    let m = machine();
    let after = Arc::new(AtomicU32::new(0));
    let after2 = after.clone();
    let (_sched, rt) = spawn_mcp(&m, 2, move |_sched| {
        // We are now running on a CG core as vcore 0 of an MCP.
        after2.store(1 + vcore_id(), Ordering::SeqCst);
    });
    assert_eq!(rt.join(), 0);
    assert_eq!(after.load(Ordering::SeqCst), 1, "main resumed as vcore 0");
}

// Scenario: request extra vcores; they come online, run uthreads, and
// show up in the shared maps.
#[test]
fn mcp_spawn_holds_three_vcores() {
    let m = machine();
    let (_sched, rt) = spawn_mcp(&m, 3, move |sched| {
        let rt = corral_user::vcore::current_runtime().unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let flag = Arc::new(AtomicU32::new(0));
        let arrived = Arc::new(AtomicU32::new(0));
        let go = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let seen = seen.clone();
            let flag = flag.clone();
            let arrived = arrived.clone();
            let go = go.clone();
            handles.push(spawn(&sched, move || {
                flag.store(1, Ordering::SeqCst);
                seen.fetch_or(1 << vcore_id(), Ordering::SeqCst);
                arrived.fetch_add(1, Ordering::SeqCst);
                // Busy-hold the vcore until main has inspected the maps.
                while !go.load(Ordering::SeqCst) {
                    cpu_relax_vc();
                }
            }));
        }
        seen.fetch_or(1 << vcore_id(), Ordering::SeqCst);
        while arrived.load(Ordering::SeqCst) < 2 {
            cpu_relax_vc();
        }

        // Both workers are busy on their cores right now.
        assert_eq!(flag.load(Ordering::SeqCst), 1);
        let pi = rt.proc().procinfo();
        assert_eq!(pi.num_vcores(), 3);
        for v in 0..3 {
            assert!(pi.vcoremap(v).valid(), "vcore {v} not mapped");
        }
        assert!(
            seen.load(Ordering::SeqCst).count_ones() == 3,
            "uthreads never spread over three vcores: {:#b}",
            seen.load(Ordering::SeqCst)
        );
        go.store(true, Ordering::SeqCst);
        for h in handles {
            h.join();
        }
    });
    assert_eq!(rt.join(), 0);
}

#[test]
fn spawn_join_returns_after_exit() {
    let m = machine();
    let (_sched, rt) = spawn_mcp(&m, 2, move |sched| {
        let done = Arc::new(AtomicU32::new(0));
        let done2 = done.clone();
        let h = spawn(&sched, move || {
            done2.store(1, Ordering::SeqCst);
        });
        h.join();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    });
    assert_eq!(rt.join(), 0);
}

#[test]
fn mutex_serializes_counter() {
    let m = machine();
    let (_sched, rt) = spawn_mcp(&m, 4, move |sched| {
        let mutex = Mutex::new(&sched);
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mutex = mutex.clone();
            let counter = counter.clone();
            handles.push(spawn(&sched, move || {
                for _ in 0..1000 {
                    mutex.with(|| {
                        // Non-atomic read-modify-write under the mutex.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    });
                }
            }));
        }
        for h in handles {
            h.join();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    });
    assert_eq!(rt.join(), 0);
}

#[test]
fn condvar_hands_off_value() {
    let m = machine();
    let (_sched, rt) = spawn_mcp(&m, 2, move |sched| {
        let mutex = Mutex::new(&sched);
        let cond = CondVar::new(&sched);
        let slot = Arc::new(AtomicU64::new(0));

        let (m2, c2, s2) = (mutex.clone(), cond.clone(), slot.clone());
        let producer = spawn(&sched, move || {
            m2.lock();
            s2.store(42, Ordering::SeqCst);
            c2.signal();
            m2.unlock();
        });

        mutex.lock();
        while slot.load(Ordering::SeqCst) == 0 {
            cond.wait(&mutex);
        }
        let got = slot.load(Ordering::SeqCst);
        mutex.unlock();
        assert_eq!(got, 42);
        producer.join();
    });
    assert_eq!(rt.join(), 0);
}

#[test]
fn barrier_rounds_with_sense_reversal() {
    let m = machine();
    let (_sched, rt) = spawn_mcp(&m, 4, move |sched| {
        const ROUNDS: u64 = 20;
        const PARTIES: usize = 4;
        let barrier = Barrier::new(&sched, PARTIES);
        let phase = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..PARTIES - 1 {
            let b = barrier.clone();
            let phase = phase.clone();
            handles.push(spawn(&sched, move || {
                for r in 0..ROUNDS {
                    b.wait();
                    // Everyone is in the same round between barriers.
                    assert_eq!(phase.load(Ordering::SeqCst), r);
                    b.wait();
                }
            }));
        }
        for _ in 0..ROUNDS {
            barrier.wait();
            barrier.wait();
            phase.fetch_add(1, Ordering::SeqCst);
        }
        for h in handles {
            h.join();
        }
    });
    assert_eq!(rt.join(), 0);
}

// Scenario: a preemption-aware spinlock whose holder's vcore is
// revoked. The waiter detects it, hands its own pcore to the holder,
// and eventually acquires the lock.
#[test]
fn spin_pdr_survives_holder_preemption() {
    let m = machine();
    let mm = m.clone();
    let (_sched, rt) = spawn_mcp(&m, 2, move |sched| {
        let rt = corral_user::vcore::current_runtime().unwrap();
        let lock = Arc::new(SpinPdr::new(0u64));
        let holder_in = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let acquired = Arc::new(AtomicBool::new(false));

        let holder_vcore = Arc::new(AtomicU32::new(u32::MAX));
        let (l2, hi2, rel2, hv2) =
            (lock.clone(), holder_in.clone(), release.clone(), holder_vcore.clone());
        let holder = spawn(&sched, move || {
            let mut guard = l2.lock();
            *guard = 1;
            hv2.store(vcore_id(), Ordering::SeqCst);
            hi2.store(true, Ordering::SeqCst);
            while !rel2.load(Ordering::SeqCst) {
                cpu_relax_vc();
            }
            drop(guard);
        });

        // Wait until the holder owns the lock, then revoke its pcore.
        while !holder_in.load(Ordering::SeqCst) {
            cpu_relax_vc();
        }
        let pcoreid = rt
            .proc()
            .procinfo()
            .vcore_pcoreid(holder_vcore.load(Ordering::SeqCst))
            .expect("holder vcore not mapped");
        assert!(mm.preempt_core(pcoreid), "preempt refused");

        let (l3, acq2) = (lock.clone(), acquired.clone());
        let waiter = spawn(&sched, move || {
            let guard = l3.lock();
            assert_eq!(*guard, 1);
            acq2.store(true, Ordering::SeqCst);
        });

        // Let the holder go once the preempt is in flight.
        release.store(true, Ordering::SeqCst);
        let deadline = read_tsc() + msec2tsc(5_000);
        while !acquired.load(Ordering::SeqCst) {
            assert!(read_tsc() < deadline, "waiter starved after preemption");
            cpu_relax_vc();
        }
        waiter.join();
        holder.join();
    });
    assert_eq!(rt.join(), 0);
}

// Scenario: a mutex holder's vcore is revoked while the holder runs
// with notifications enabled; recovery reattaches the interrupted
// uthread on another vcore and the waiter gets the mutex.
#[test]
fn mutex_holder_preemption_recovers() {
    let m = machine();
    let mm = m.clone();
    let (_sched, rt) = spawn_mcp(&m, 3, move |sched| {
        let rt = corral_user::vcore::current_runtime().unwrap();
        let mutex = Mutex::new(&sched);
        let holder_in = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let got_it = Arc::new(AtomicBool::new(false));
        let holder_vcore = Arc::new(AtomicU32::new(u32::MAX));

        let (mx2, hi2, rel2, hv2) = (
            mutex.clone(),
            holder_in.clone(),
            release.clone(),
            holder_vcore.clone(),
        );
        let holder = spawn(&sched, move || {
            mx2.lock();
            hv2.store(vcore_id(), Ordering::SeqCst);
            hi2.store(true, Ordering::SeqCst);
            // Notifs are enabled here: an arriving revocation saves us
            // into the notif slot for recovery.
            while !rel2.load(Ordering::SeqCst) {
                cpu_relax_vc();
            }
            mx2.unlock();
        });

        while !holder_in.load(Ordering::SeqCst) {
            cpu_relax_vc();
        }
        let hv = holder_vcore.load(Ordering::SeqCst);
        let pcoreid = rt
            .proc()
            .procinfo()
            .vcore_pcoreid(hv)
            .expect("holder vcore not mapped");
        assert!(mm.preempt_core(pcoreid));

        let (mx3, gi2) = (mutex.clone(), got_it.clone());
        let waiter = spawn(&sched, move || {
            mx3.lock();
            gi2.store(true, Ordering::SeqCst);
            mx3.unlock();
        });

        release.store(true, Ordering::SeqCst);
        let deadline = read_tsc() + msec2tsc(5_000);
        while !got_it.load(Ordering::SeqCst) {
            assert!(read_tsc() < deadline, "mutex waiter starved");
            cpu_relax_vc();
        }
        waiter.join();
        holder.join();
    });
    assert_eq!(rt.join(), 0);
}

// Syscalls from many uthreads multiplexed over fewer vcores.
#[test]
fn many_blocking_syscalls_few_vcores() {
    let m = machine();
    let chan = m.chan_create();
    let (_sched, rt) = spawn_mcp(&m, 2, move |sched| {
        let rt = corral_user::vcore::current_runtime().unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rt2 = rt.clone();
            handles.push(spawn(&sched, move || {
                let got = corral_user::syscall::sys_chan_read(&rt2, chan, 1)
                    .expect("read failed");
                assert_eq!(got.len(), 1);
            }));
        }
        // Feed one byte per blocked reader.
        for i in 0..8u8 {
            corral_user::syscall::sys_chan_write(&rt, chan, &[i]).unwrap();
        }
        for h in handles {
            h.join();
        }
    });
    assert_eq!(rt.join(), 0);
}
