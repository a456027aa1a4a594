//! UCQ stress: a million messages through one mailbox.

use corral_event::{EventMsg, Ucq};

fn msg(n: u64) -> EventMsg {
    EventMsg {
        ev_type: 1,
        ev_arg1: 0,
        ev_arg2: 0,
        ev_arg3: n,
        ev_arg4: 0,
    }
}

#[test]
fn million_messages_fifo_no_gaps() {
    const N: u64 = 1_000_000;
    let ucq = Ucq::new();
    for i in 0..N {
        ucq.post(&msg(i));
    }
    // Growth is bounded by the reserve-then-fill protocol: one page per
    // slots_per_page messages, plus the install slack.
    let slots = Ucq::slots_per_page() as u64;
    let bound = N.div_ceil(slots) + 1;
    assert!(
        (ucq.extra_pages() as u64) <= bound,
        "allocated {} extra pages, bound {bound}",
        ucq.extra_pages()
    );
    for i in 0..N {
        let got = ucq.extract_one().expect("queue ran dry early");
        assert_eq!(got.ev_arg3, i, "gap or reorder");
    }
    assert!(ucq.extract_one().is_none());
    assert!(ucq.is_empty());
    // Drained pages were recycled or freed.
    assert!(ucq.extra_pages() <= 1, "pages leaked: {}", ucq.extra_pages());
}

#[test]
fn producer_consumer_pipeline() {
    const N: u64 = 200_000;
    let ucq = std::sync::Arc::new(Ucq::new());
    let producer = {
        let ucq = ucq.clone();
        std::thread::spawn(move || {
            for i in 0..N {
                ucq.post(&msg(i));
            }
        })
    };
    let mut next = 0;
    while next < N {
        if let Some(m) = ucq.extract_one() {
            assert_eq!(m.ev_arg3, next);
            next += 1;
        } else {
            std::hint::spin_loop();
        }
    }
    producer.join().unwrap();
    assert!(ucq.is_empty());
}
