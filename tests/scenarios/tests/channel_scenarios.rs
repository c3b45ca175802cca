//! Channel scenarios: backpressure, close-drain, ordering, and the
//! dual legion/bare-thread blocking modes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use infernal_runtime::{channel, yield_now};
use infernal_scenario_tests::{go, runtime, wait_until, SCENARIO_TIMEOUT};

#[test]
fn backpressure_preserves_order_and_parks_the_sender() {
    let _rt = runtime();
    let ch = channel(8, 2);
    let release = Arc::new(AtomicBool::new(false));
    let out = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let ch = ch.clone();
        go(move || {
            // Four sends into a two-slot buffer, no voluntary yields: the
            // third must park.
            for v in [10i64, 20, 30, 40] {
                ch.send_value(v);
            }
        });
    }
    {
        let ch = ch.clone();
        let release = release.clone();
        let out = out.clone();
        let done = done.clone();
        go(move || {
            while !release.load(Ordering::SeqCst) {
                yield_now();
            }
            for _ in 0..4 {
                out.lock().unwrap().push(ch.recv_value::<i64>().unwrap());
            }
            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(
        wait_until(|| ch.parked_senders() > 0),
        "the sender must park on the full buffer"
    );
    release.store(true, Ordering::SeqCst);
    assert!(wait_until(|| done.load(Ordering::SeqCst)));
    assert_eq!(*out.lock().unwrap(), vec![10, 20, 30, 40]);
}

#[test]
fn close_drain_reads_the_sentinel() {
    let _rt = runtime();
    let ch = channel(8, 4);

    {
        let ch = ch.clone();
        go(move || {
            for v in [1i64, 2, 3] {
                ch.send_value(v);
            }
            ch.close();
        });
    }

    // Main is a bare thread: these block on the condvar side.
    assert_eq!(ch.recv_value::<i64>(), Some(1));
    assert_eq!(ch.recv_value::<i64>(), Some(2));
    assert_eq!(ch.recv_value::<i64>(), Some(3));
    assert_eq!(ch.recv_value::<i64>(), None);
}

#[test]
fn single_pair_round_trip_is_fifo() {
    const N: i64 = 200;
    let _rt = runtime();
    let ch = channel(8, 7);
    let out = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let ch = ch.clone();
        go(move || {
            for v in 0..N {
                ch.send_value(v);
            }
        });
    }
    {
        let ch = ch.clone();
        let out = out.clone();
        let done = done.clone();
        go(move || {
            for _ in 0..N {
                out.lock().unwrap().push(ch.recv_value::<i64>().unwrap());
            }
            done.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_until(|| done.load(Ordering::SeqCst)));
    assert_eq!(*out.lock().unwrap(), (0..N).collect::<Vec<_>>());
}

#[test]
fn count_stays_bounded_under_contention() {
    const SENDERS: usize = 4;
    const PER_SENDER: i64 = 50;
    let _rt = runtime();
    let ch = channel(8, 4);
    let received = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicUsize::new(0));

    for s in 0..SENDERS as i64 {
        let ch = ch.clone();
        go(move || {
            for v in 0..PER_SENDER {
                ch.send_value(s * PER_SENDER + v);
            }
        });
    }
    for _ in 0..SENDERS {
        let ch = ch.clone();
        let received = received.clone();
        let finished = finished.clone();
        go(move || {
            for _ in 0..PER_SENDER {
                let v = ch.recv_value::<i64>().unwrap();
                received.lock().unwrap().push(v);
            }
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Sample the buffer while traffic flows: it must never overfill.
    let deadline = Instant::now() + SCENARIO_TIMEOUT;
    while finished.load(Ordering::SeqCst) < SENDERS {
        assert!(ch.len() <= ch.capacity());
        assert!(Instant::now() < deadline, "contention scenario timed out");
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    let received = received.lock().unwrap();
    let distinct: HashSet<_> = received.iter().copied().collect();
    assert_eq!(received.len(), SENDERS * PER_SENDER as usize);
    assert_eq!(distinct.len(), SENDERS * PER_SENDER as usize);
}

#[test]
fn bare_thread_sender_feeds_legion_receiver() {
    // Termination travels in-band: close() wakes bare-thread waiters but
    // leaves parked legions to their next channel cycle, so a legion that
    // drains until closure could park forever. A sentinel value is the
    // supported stop signal.
    const N: i64 = 30;
    const STOP: i64 = -1;
    let _rt = runtime();
    let ch = channel(8, 2);
    let out = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    {
        let ch = ch.clone();
        let out = out.clone();
        let done = done.clone();
        go(move || loop {
            match ch.recv_value::<i64>() {
                Some(STOP) | None => break done.store(true, Ordering::SeqCst),
                Some(v) => out.lock().unwrap().push(v),
            }
        });
    }

    let producer = {
        let ch = ch.clone();
        std::thread::spawn(move || {
            for v in 0..N {
                ch.send_value(v);
            }
            ch.send_value(STOP);
        })
    };

    assert!(wait_until(|| done.load(Ordering::SeqCst)));
    producer.join().unwrap();
    assert_eq!(*out.lock().unwrap(), (0..N).collect::<Vec<_>>());
}
