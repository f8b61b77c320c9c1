//! Timed wait example
//!
//! Shows the three ways a sleeping fiber comes back: the deadline
//! fires, an external set_ready wakes it early, or it is interrupted.

use std::time::{Duration, Instant};
use strand::{sleep, spawn, wait_until, yield_now, FiberError};

fn main() {
    println!("=== strand sleep example ===\n");

    // Deadline fires
    let timer = spawn(|| {
        let start = Instant::now();
        let fired = wait_until(Instant::now() + Duration::from_millis(50)).unwrap();
        println!("[timer] fired={} after {:?}", fired, start.elapsed());
    })
    .expect("spawn failed");
    timer.join().unwrap();

    // Early wake
    let sleeper = spawn(|| {
        let start = Instant::now();
        let fired = wait_until(Instant::now() + Duration::from_secs(60)).unwrap();
        println!("[sleeper] fired={} after {:?}", fired, start.elapsed());
    })
    .expect("spawn failed");
    yield_now();
    sleeper.set_ready();
    sleeper.join().unwrap();

    // Interruption
    let stuck = spawn(|| match sleep(Duration::from_secs(3600)) {
        Err(FiberError::Interrupted) => println!("[stuck] interrupted out of a 1h sleep"),
        other => println!("[stuck] unexpected result: {:?}", other),
    })
    .expect("spawn failed");
    yield_now();
    stuck.interrupt();
    stuck.join().unwrap();

    println!("\n=== done ===");
}
