//! Example viewer (consumer side)
//!
//! Connects to a running simulation, synchronizes every frame and prints a
//! summary of what a renderer would redraw. Pass the port the simulation
//! printed on startup.

use simlink::{Consumer, ConsumerConfig};
use std::time::Duration;

fn main() {
    env_logger::init();

    let port: u16 = match std::env::args().nth(1).and_then(|s| s.parse().ok()) {
        Some(p) => p,
        None => {
            eprintln!("Usage: viewer <port>");
            std::process::exit(1);
        }
    };

    let mut consumer = match Consumer::connect(port, ConsumerConfig::default()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Viewer] Could not reach the simulation on port {port}: {e}");
            std::process::exit(1);
        }
    };

    println!("[Viewer] Connected, {} objects", consumer.object_count());
    for id in 0..consumer.object_count() {
        let kind = consumer.kind_of(id).expect("kind");
        let snapshot = consumer.snapshot(id).expect("snapshot");
        let fields: Vec<&str> = snapshot.field_names().collect();
        println!("[Viewer]   #{id} {kind:?}: {}", fields.join(", "));
    }

    let exit = consumer.watch_exit();
    while !exit.exit_requested() {
        match consumer.frame_tick() {
            Ok(true) => {
                let step = consumer.applied_step();
                let mut redrawn = 0usize;
                for id in 0..consumer.object_count() {
                    let snapshot = consumer.snapshot(id).expect("snapshot");
                    redrawn += snapshot
                        .field_names()
                        .filter(|name| snapshot.dirty(name))
                        .count();
                }
                println!("[Viewer] Frame {step}: {redrawn} dirty fields");
            }
            Ok(false) => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => {
                eprintln!("[Viewer] Frame sync failed: {e}");
                break;
            }
        }
    }
    drop(exit);

    println!("[Viewer] Simulation is shutting down");
    consumer.shutdown().expect("shutdown");
    println!("[Viewer] Session closed");
}
