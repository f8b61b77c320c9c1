//! Basic fiber example
//!
//! Spawns three fibers that take turns via yield, then joins them.

use strand::{spawn, yield_now};

fn main() {
    println!("=== strand basic example ===\n");

    let mut handles = Vec::new();
    for name in ["A", "B", "C"] {
        let fiber = spawn(move || {
            for round in 0..3 {
                println!("[fiber {}] round {}", name, round);
                yield_now();
            }
            name
        })
        .expect("spawn failed");
        println!("spawned fiber {} ({})", name, fiber.id());
        handles.push(fiber);
    }

    println!();
    for fiber in handles {
        let name = fiber.join().expect("join failed");
        println!("joined fiber {}", name);
    }

    println!("\n=== done ===");
}
