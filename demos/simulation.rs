//! Example simulation (producer side)
//!
//! Publishes a ring of orbiting points plus a step-counter caption, then
//! steps the session. Run the viewer example against the printed port.

use simlink::{Points, PointsUpdate, Producer, ProducerConfig, Text, TextUpdate};
use std::time::Duration;

const POINT_COUNT: usize = 64;

fn ring(step: u64) -> Vec<[f64; 3]> {
    (0..POINT_COUNT)
        .map(|i| {
            let angle = (i as f64 / POINT_COUNT as f64 + step as f64 / 200.0)
                * std::f64::consts::TAU;
            [angle.cos(), angle.sin(), (step as f64 / 50.0).sin() * 0.2]
        })
        .collect()
}

fn main() {
    env_logger::init();

    let steps: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(500);

    let mut producer = match Producer::new(ProducerConfig {
        sync: true,
        ..Default::default()
    }) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("[Sim] Failed to create session: {e}");
            std::process::exit(1);
        }
    };

    let points = producer
        .add_points(Points {
            positions: ring(0),
            color: "orange".into(),
            point_size: 6.0,
            ..Default::default()
        })
        .expect("points object");
    let caption = producer
        .add_text(Text {
            content: "step 0".into(),
            corner: "TL".into(),
            ..Default::default()
        })
        .expect("text object");

    let port = producer.bind(None).expect("bind");
    println!("[Sim] Listening on port {port}");
    println!("[Sim] Start the viewer: cargo run --example viewer -- {port}");

    if let Err(e) = producer.connect() {
        eprintln!("[Sim] Handshake failed: {e}");
        std::process::exit(1);
    }
    println!("[Sim] Viewer connected, running {steps} steps");

    for step in 1..=steps {
        if !producer.is_open() {
            println!("[Sim] Viewer requested exit");
            break;
        }
        producer
            .update_points(
                points,
                PointsUpdate {
                    positions: Some(ring(step)),
                    ..Default::default()
                },
            )
            .expect("update points");
        producer
            .update_text(
                caption,
                TextUpdate {
                    content: Some(format!("step {step}")),
                    ..Default::default()
                },
            )
            .expect("update caption");
        producer.step().expect("step");
        std::thread::sleep(Duration::from_millis(10));
    }

    producer.shutdown().expect("shutdown");
    println!("[Sim] Session closed");
}
