//! Two legions bouncing a counter over a pair of capacity-1 channels.
//!
//! Run with `RUST_LOG=debug cargo run --example ping_pong` to watch the
//! scheduler work.

use infernal_runtime::{channel, sched, spawn_fn, start};

const ROUNDS: i64 = 10;

fn main() {
    env_logger::init();
    sched::init();

    let ping = channel(8, 1);
    let pong = channel(8, 1);
    let result = channel(8, 1);

    {
        let (ping, pong, result) = (ping.clone(), pong.clone(), result.clone());
        let a = spawn_fn(
            move || {
                let mut v = 0i64;
                for _ in 0..ROUNDS {
                    ping.send_value(v);
                    v = pong.recv_value::<i64>().unwrap();
                }
                result.send_value(v);
            },
            0,
        );
        start(a).unwrap();
    }
    {
        let b = spawn_fn(
            move || {
                for _ in 0..ROUNDS {
                    let v = ping.recv_value::<i64>().unwrap();
                    pong.send_value(v + 1);
                }
            },
            0,
        );
        start(b).unwrap();
    }

    let total = result.recv_value::<i64>().unwrap();
    println!("{ROUNDS} rounds, final count {total}");

    sched::shutdown();
}
