//! Example batch session
//!
//! Runs several simulations in one process, mirrors all of them through a
//! single router and cycles which one is attached to the (stand-in) display
//! surface. Real deployments run each simulation in its own process over
//! the same pre-agreed ports.

use simlink::{
    allocate_ports, BatchRouter, ConsumerConfig, Points, PointsUpdate, Producer, ProducerConfig,
    Surface,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SOURCES: usize = 3;

struct PrintSurface;

impl Surface for PrintSurface {
    fn attach(&mut self, source: usize, object_ids: &[usize]) {
        println!("[Batch] Showing source {source} (objects {object_ids:?})");
    }

    fn detach(&mut self, source: usize, object_ids: &[usize]) {
        println!("[Batch] Hiding source {source} (objects {object_ids:?})");
    }
}

fn run_source(port: u16, offset: f64, stop: Arc<AtomicBool>) {
    let mut producer = Producer::new(ProducerConfig::default()).expect("session");
    let id = producer
        .add_points(Points {
            positions: vec![[offset, 0.0, 0.0]; 16],
            ..Default::default()
        })
        .expect("points");
    producer.bind(Some(port)).expect("bind");
    producer.connect().expect("handshake");

    let mut step = 0u64;
    while !stop.load(Ordering::Acquire) {
        step += 1;
        let y = (step as f64 / 30.0 + offset).sin();
        producer
            .update_points(
                id,
                PointsUpdate {
                    positions: Some(vec![[offset, y, 0.0]; 16]),
                    ..Default::default()
                },
            )
            .expect("update");
        producer.step().expect("step");
    }
    producer.shutdown().expect("shutdown");
}

fn main() {
    env_logger::init();

    let ports = allocate_ports(SOURCES).expect("ports");
    println!("[Batch] Ports: {ports:?}");

    let stop = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = ports
        .iter()
        .enumerate()
        .map(|(i, &port)| {
            let stop = Arc::clone(&stop);
            thread::spawn(move || run_source(port, i as f64, stop))
        })
        .collect();

    let mut router = match BatchRouter::connect(&ports, ConsumerConfig::default()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("[Batch] Could not connect all sources: {e}");
            std::process::exit(1);
        }
    };
    println!("[Batch] {} sources connected", router.source_count());

    let mut surface = PrintSurface;
    router.attach(0, &mut surface).expect("attach");

    // Give each source a couple of seconds on the surface.
    for round in 0..2 * SOURCES {
        let until = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < until {
            router.tick_all();
            thread::sleep(Duration::from_millis(5));
        }
        let next = (round + 1) % SOURCES;
        for source in 0..SOURCES {
            let steps = router.consumer(source).map(|c| c.step_count()).unwrap_or(0);
            println!("[Batch]   source {source}: {steps} steps");
        }
        router.set_active(next, &mut surface).expect("switch");
    }

    stop.store(true, Ordering::Release);
    while (0..SOURCES).any(|s| router.is_alive(s)) {
        router.tick_all();
        thread::sleep(Duration::from_millis(20));
    }
    for handle in handles {
        handle.join().expect("source thread");
    }
    println!("[Batch] All sources closed");
}
