//! Machine-level tests: devices, the async syscall contract, and
//! allocator bookkeeping, all without a user runtime on top.

use std::sync::Arc;
use std::time::Duration;

use corral_abi::event::EV_ALARM;
use corral_abi::syscall::nr;
use corral_abi::{Errno, EventQueue, EvqFlags, Syscall};
use corral_core::time::{msec2tsc, read_tsc};
use corral_event::MboxKind;
use corral_kernel::{Machine, MachineConfig};

fn machine() -> Machine {
    Machine::bring_up(MachineConfig::default())
}

fn dummy_proc(m: &Machine) -> Arc<corral_kernel::proc::Proc> {
    m.proc_create(Arc::new(|_vcoreid| {}))
}

fn wait_done(sysc: &Arc<Syscall>, timeout: Duration) {
    let start = std::time::Instant::now();
    while !sysc.done() {
        assert!(start.elapsed() < timeout, "syscall never completed");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn chan_write_then_read_is_synchronous() {
    let m = machine();
    let p = dummy_proc(&m);
    let chan = m.chan_create();

    let w = Arc::new(Syscall::new(nr::CHAN_WRITE, [chan, 0, 0, 0, 0, 0]));
    w.set_data(b"hello".to_vec());
    m.submit(&p, &w);
    assert!(w.done());
    assert_eq!(w.retval(), 5);

    let r = Arc::new(Syscall::new(nr::CHAN_READ, [chan, 3, 0, 0, 0, 0]));
    m.submit(&p, &r);
    assert!(r.done(), "read with data available must be synchronous");
    assert_eq!(r.retval(), 3);
    assert_eq!(r.take_data(), b"hel");
}

#[test]
fn empty_chan_read_blocks_until_write() {
    let m = machine();
    let p = dummy_proc(&m);
    let chan = m.chan_create();

    let r = Arc::new(Syscall::new(nr::CHAN_READ, [chan, 8, 0, 0, 0, 0]));
    m.submit(&p, &r);
    assert!(!r.done(), "empty-channel read must stay in flight");

    let w = Arc::new(Syscall::new(nr::CHAN_WRITE, [chan, 0, 0, 0, 0, 0]));
    w.set_data(b"data".to_vec());
    m.submit(&p, &w);

    wait_done(&r, Duration::from_secs(2));
    assert_eq!(r.retval(), 4);
    assert_eq!(r.take_data(), b"data");
}

#[test]
fn completion_event_reaches_registered_evq() {
    let m = machine();
    let p = dummy_proc(&m);
    let chan = m.chan_create();

    let evq = Arc::new(EventQueue::new(MboxKind::Ucq, EvqFlags::empty()));
    let evq_id = p.evqs.insert(evq.clone());

    let r = Arc::new(Syscall::new(nr::CHAN_READ, [chan, 1, 0, 0, 0, 0]));
    m.submit(&p, &r);
    assert!(r.register_evq(evq_id), "registration must win while parked");

    let w = Arc::new(Syscall::new(nr::CHAN_WRITE, [chan, 0, 0, 0, 0, 0]));
    w.set_data(b"x".to_vec());
    m.submit(&p, &w);

    wait_done(&r, Duration::from_secs(2));
    let msg = evq.mbox().extract_one().expect("no completion event");
    assert_eq!(msg.ev_type, corral_abi::event::EV_SYSCALL);
    assert_eq!(msg.ev_arg3, corral_kernel::sysc_addr(&r));
}

#[test]
fn abort_completes_blocked_read_with_eintr() {
    let m = machine();
    let p = dummy_proc(&m);
    let chan = m.chan_create();

    let r = Arc::new(Syscall::new(nr::CHAN_READ, [chan, 8, 0, 0, 0, 0]));
    m.submit(&p, &r);
    assert!(!r.done());
    assert!(m.abort_sysc(&r));
    assert!(r.done());
    assert_eq!(r.err(), Some(Errno::EINTR));

    // The cancelled reader must not consume a later write.
    let w = Arc::new(Syscall::new(nr::CHAN_WRITE, [chan, 0, 0, 0, 0, 0]));
    w.set_data(b"later".to_vec());
    m.submit(&p, &w);
    let r2 = Arc::new(Syscall::new(nr::CHAN_READ, [chan, 5, 0, 0, 0, 0]));
    m.submit(&p, &r2);
    assert!(r2.done());
    assert_eq!(r2.take_data(), b"later");
}

#[test]
fn sys_block_completes_after_deadline() {
    let m = machine();
    let p = dummy_proc(&m);
    let start = read_tsc();
    let b = Arc::new(Syscall::new(nr::BLOCK, [20_000, 0, 0, 0, 0, 0]));
    m.submit(&p, &b);
    assert!(!b.done(), "sys_block must be asynchronous");
    wait_done(&b, Duration::from_secs(5));
    let elapsed = read_tsc() - start;
    assert!(elapsed >= msec2tsc(19), "woke too early: {elapsed} ticks");
}

#[test]
fn devalarm_fires_into_bound_evq() {
    let m = machine();
    let p = dummy_proc(&m);
    let evq = Arc::new(EventQueue::new(MboxKind::Ucq, EvqFlags::empty()));
    let evq_id = p.evqs.insert(evq.clone());

    let clone = Arc::new(Syscall::new(nr::ALARM_CLONE, [0; 6]));
    m.submit(&p, &clone);
    assert!(clone.done());
    #[expect(clippy::cast_sign_loss, reason = "alarm id")]
    let alarm_id = clone.retval() as u64;

    let ctl = Arc::new(Syscall::new(nr::ALARM_CTL_READ, [alarm_id, 0, 0, 0, 0, 0]));
    m.submit(&p, &ctl);
    assert_eq!(
        String::from_utf8(ctl.take_data()).unwrap(),
        alarm_id.to_string()
    );

    let bind = Arc::new(Syscall::new(nr::ALARM_EVQCTL_WRITE, [alarm_id, 0, 0, 0, 0, 0]));
    bind.set_data(evq_id.encode().to_string().into_bytes());
    m.submit(&p, &bind);
    assert!(bind.err().is_none());

    let deadline = read_tsc() + msec2tsc(30);
    let arm = Arc::new(Syscall::new(nr::ALARM_TIMER_WRITE, [alarm_id, 0, 0, 0, 0, 0]));
    arm.set_data(deadline.to_string().into_bytes());
    m.submit(&p, &arm);
    assert!(arm.err().is_none());

    let start = std::time::Instant::now();
    let msg = loop {
        if let Some(msg) = evq.mbox().extract_one() {
            break msg;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "alarm never fired");
        std::thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(msg.ev_type, EV_ALARM);
    assert!(read_tsc() >= deadline, "fired before its deadline");
}

#[test]
fn disarmed_alarm_does_not_fire() {
    let m = machine();
    let p = dummy_proc(&m);
    let evq = Arc::new(EventQueue::new(MboxKind::Ucq, EvqFlags::empty()));
    let evq_id = p.evqs.insert(evq.clone());

    let clone = Arc::new(Syscall::new(nr::ALARM_CLONE, [0; 6]));
    m.submit(&p, &clone);
    #[expect(clippy::cast_sign_loss, reason = "alarm id")]
    let alarm_id = clone.retval() as u64;
    let bind = Arc::new(Syscall::new(nr::ALARM_EVQCTL_WRITE, [alarm_id, 0, 0, 0, 0, 0]));
    bind.set_data(evq_id.encode().to_string().into_bytes());
    m.submit(&p, &bind);

    let deadline = read_tsc() + msec2tsc(40);
    let arm = Arc::new(Syscall::new(nr::ALARM_TIMER_WRITE, [alarm_id, 0, 0, 0, 0, 0]));
    arm.set_data(deadline.to_string().into_bytes());
    m.submit(&p, &arm);

    // Disarm well before the deadline.
    let disarm = Arc::new(Syscall::new(nr::ALARM_TIMER_WRITE, [alarm_id, 0, 0, 0, 0, 0]));
    disarm.set_data(b"0".to_vec());
    m.submit(&p, &disarm);

    std::thread::sleep(Duration::from_millis(80));
    assert!(evq.mbox().extract_one().is_none(), "disarmed alarm fired");
}

#[test]
fn destroyed_proc_leaves_no_allocator_traces() {
    let m = machine();
    let p = dummy_proc(&m);
    let pid = p.pid();

    // Provision a couple of CG cores to it first.
    for pc in [m.nr_ll_cores(), m.nr_ll_cores() + 1] {
        let prov = Arc::new(Syscall::new(
            nr::PROVISION,
            [u64::from(pid), 0, u64::from(pc), 0, 0, 0],
        ));
        m.submit(&p, &prov);
        assert!(prov.err().is_none());
    }
    m.proc_destroy(&p, 0);
    assert!(m.proc_fully_released(pid));
    assert!(m.lookup_proc(pid).is_none());
}

#[test]
fn provisioning_ll_core_is_rejected() {
    let m = machine();
    let p = dummy_proc(&m);
    let prov = Arc::new(Syscall::new(nr::PROVISION, [u64::from(p.pid()), 0, 0, 0, 0, 0]));
    m.submit(&p, &prov);
    assert_eq!(prov.err(), Some(Errno::EINVAL));
}

#[test]
fn unknown_syscall_returns_enosys() {
    let m = machine();
    let p = dummy_proc(&m);
    let bad = Arc::new(Syscall::new(9999, [0; 6]));
    m.submit(&p, &bad);
    assert_eq!(bad.err(), Some(Errno::ENOSYS));
}
