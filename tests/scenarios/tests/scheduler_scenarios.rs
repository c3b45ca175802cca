//! Scheduler scenarios: ping-pong, fan-out across workers, stealing,
//! yield fairness, and lifecycle edges.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use infernal_runtime::{channel, current_worker, yield_now, LegionState};
use infernal_scenario_tests::{go, go_on, runtime, wait_until};

#[test]
fn ping_pong_completes() {
    let _rt = runtime();
    let c_ab = channel(8, 1);
    let c_ba = channel(8, 1);
    let a_got = Arc::new(AtomicI64::new(0));
    let b_got = Arc::new(AtomicI64::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    {
        let (c_ab, c_ba) = (c_ab.clone(), c_ba.clone());
        let (a_got, done) = (a_got.clone(), done.clone());
        go(move || {
            c_ab.send_value(1i64);
            a_got.store(c_ba.recv_value::<i64>().unwrap(), Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let (b_got, done) = (b_got.clone(), done.clone());
        go(move || {
            let v = c_ab.recv_value::<i64>().unwrap();
            b_got.store(v, Ordering::SeqCst);
            c_ba.send_value(v + 1);
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(|| done.load(Ordering::SeqCst) == 2));
    assert_eq!(b_got.load(Ordering::SeqCst), 1);
    assert_eq!(a_got.load(Ordering::SeqCst), 2);
    assert!(infernal_runtime::sched::context_switch_count() > 0);
}

/// One fan-out observation: which slot a legion claimed and where it ran.
#[repr(C)]
#[derive(Clone, Copy)]
struct Obs {
    idx: i64,
    worker: i64,
}

#[test]
fn fan_out_covers_all_indices_on_multiple_workers() {
    const LEGIONS: i64 = 64;
    let _rt = runtime();
    let ch = channel(core::mem::size_of::<Obs>(), LEGIONS as usize);
    let next = Arc::new(AtomicI64::new(0));

    for _ in 0..LEGIONS {
        let ch = ch.clone();
        let next = next.clone();
        go(move || {
            let idx = next.fetch_add(1, Ordering::SeqCst);
            ch.send_value(Obs {
                idx,
                worker: current_worker() as i64,
            });
        });
    }

    let mut indices = HashSet::new();
    let mut workers = HashSet::new();
    for _ in 0..LEGIONS {
        let obs = ch.recv_value::<Obs>().unwrap();
        indices.insert(obs.idx);
        workers.insert(obs.worker);
    }

    assert_eq!(indices, (0..LEGIONS).collect::<HashSet<_>>());
    assert!(
        workers.len() >= 2,
        "64 legions across a 4-worker pool must touch at least two workers, saw {workers:?}"
    );
}

#[test]
fn idle_workers_steal_from_a_loaded_queue() {
    const LEGIONS: usize = 8;
    let _rt = runtime();
    let hosts = Arc::new(Mutex::new(HashSet::new()));
    let finished = Arc::new(AtomicUsize::new(0));

    // Everything lands on worker 0's ring; the other three are idle and
    // must steal to help.
    for _ in 0..LEGIONS {
        let hosts = hosts.clone();
        let finished = finished.clone();
        go_on(0, move || {
            for _ in 0..50 {
                hosts.lock().unwrap().insert(current_worker());
                yield_now();
            }
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(|| finished.load(Ordering::SeqCst) == LEGIONS));
    let hosts = hosts.lock().unwrap();
    assert!(!hosts.contains(&-1), "legions always observe a worker id");
    assert!(
        hosts.len() >= 2,
        "idle workers must have stolen some of the load, saw {hosts:?}"
    );
}

#[test]
fn yielding_legions_on_one_worker_share_it_fairly() {
    let _rt = runtime();
    let stop = Arc::new(AtomicBool::new(false));
    let counts = [Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0))];
    let finished = Arc::new(AtomicUsize::new(0));

    for count in &counts {
        let stop = stop.clone();
        let count = count.clone();
        let finished = finished.clone();
        go_on(0, move || {
            while !stop.load(Ordering::SeqCst) {
                count.fetch_add(1, Ordering::SeqCst);
                yield_now();
            }
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    std::thread::sleep(Duration::from_millis(50));
    stop.store(true, Ordering::SeqCst);
    assert!(wait_until(|| finished.load(Ordering::SeqCst) == 2));

    let a = counts[0].load(Ordering::SeqCst);
    let b = counts[1].load(Ordering::SeqCst);
    assert!(a > 0 && b > 0, "both legions must make progress ({a} vs {b})");
    let (hi, lo) = (a.max(b), a.min(b));
    assert!(
        hi <= lo.saturating_mul(2),
        "yield alternation keeps progress within 2x ({a} vs {b})"
    );
}

#[test]
fn spawn_start_split_runs_to_death() {
    let _rt = runtime();
    let ran = Arc::new(AtomicBool::new(false));

    let legion = infernal_runtime::spawn_fn(
        {
            let ran = ran.clone();
            move || ran.store(true, Ordering::SeqCst)
        },
        0,
    );

    // Inspectable before it runs: that is the point of the split.
    assert_eq!(legion.state(), LegionState::Runnable);
    assert_eq!(legion.worker(), -1);
    assert!(legion.blocked_on().is_none());

    infernal_runtime::start(legion.clone()).unwrap();
    assert!(wait_until(|| legion.state() == LegionState::Dead));
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn yield_outside_a_legion_is_a_noop() {
    let _rt = runtime();
    assert!(infernal_runtime::sched::is_initialized());
    assert!(infernal_runtime::current_legion().is_none());
    yield_now();
    assert_eq!(current_worker(), -1);
}

#[test]
fn active_count_settles_after_a_burst() {
    let _rt = runtime();
    // Relative to the baseline: legions abandoned by earlier scenarios'
    // shutdowns stay counted forever, by design.
    let base = infernal_runtime::sched::active_legions();
    for _ in 0..16 {
        go(|| {});
    }
    assert!(wait_until(|| {
        infernal_runtime::sched::active_legions() <= base
    }));
    assert_eq!(infernal_runtime::sched::queue_lens().iter().sum::<usize>(), 0);
}

#[test]
fn blocked_legion_reports_its_channel() {
    let _rt = runtime();
    let ch = channel(8, 1);
    let started = Arc::new(AtomicBool::new(false));

    let legion = infernal_runtime::spawn_fn(
        {
            let ch = ch.clone();
            let started = started.clone();
            move || {
                started.store(true, Ordering::SeqCst);
                // Parks: nothing is ever sent here until the wake below.
                let _ = ch.recv_value::<i64>();
            }
        },
        0,
    );
    infernal_runtime::start(legion.clone()).unwrap();

    assert!(wait_until(|| legion.state() == LegionState::Blocked));
    assert!(started.load(Ordering::SeqCst));
    let blocked_on = legion.blocked_on().expect("park records the channel");
    assert!(Arc::ptr_eq(&blocked_on, &ch));

    // Wake it so the scenario tears down clean.
    ch.send_value(99i64);
    assert!(wait_until(|| legion.state() == LegionState::Dead));
}
