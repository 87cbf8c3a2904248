//! End-to-end producer/consumer sessions
//!
//! Both sides run in one process (the segments and sockets do not care),
//! producer on a spawned thread, consumer on the test thread.

use simlink::shm::ShmSegment;
use simlink::{
    allocate_ports, Arrows, BatchRouter, Consumer, ConsumerConfig, Dtype, Lines, Mesh, ObjectKind,
    Points, PointsUpdate, Producer, ProducerConfig, SimlinkError, Surface, Text,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn sync_config() -> ProducerConfig {
    ProducerConfig {
        sync: true,
        ..Default::default()
    }
}

fn wait_for_frame(consumer: &mut Consumer) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !consumer.frame_tick().unwrap() {
        assert!(Instant::now() < deadline, "no frame within 5s");
        thread::sleep(Duration::from_micros(200));
    }
}

/// Run both shutdown halves without deadlocking the test thread.
fn close(producer_handle: thread::JoinHandle<Producer>, mut consumer: Consumer) {
    let consumer_half = thread::spawn(move || consumer.shutdown().unwrap());
    let mut producer = producer_handle.join().unwrap();
    producer.shutdown().unwrap();
    consumer_half.join().unwrap();
}

#[test]
fn round_trip_reconstructs_every_kind() {
    let mut producer = Producer::new(ProducerConfig::default()).unwrap();
    producer
        .add_mesh(Mesh {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            cells: vec![3, 0, 1, 2],
            ..Default::default()
        })
        .unwrap();
    producer
        .add_points(Points {
            positions: vec![[0.5, 0.5, 0.5]; 7],
            colormap_field: vec![0.0, 0.2, 0.4, 0.6, 0.8, 1.0, 1.2],
            ..Default::default()
        })
        .unwrap();
    producer
        .add_arrows(Arrows {
            positions: vec![[0.0; 3]; 2],
            vectors: vec![[0.0, 0.0, 1.0]; 2],
            ..Default::default()
        })
        .unwrap();
    producer
        .add_lines(Lines {
            start_positions: vec![[0.0; 3]],
            end_positions: vec![[1.0; 3]],
            line_width: 2.0,
            ..Default::default()
        })
        .unwrap();
    producer
        .add_text(Text {
            content: "step 0".into(),
            corner: "TL".into(),
            ..Default::default()
        })
        .unwrap();

    let port = producer.bind(None).unwrap();
    let handle = thread::spawn(move || {
        producer.connect().unwrap();
        producer
    });
    let consumer = Consumer::connect(port, ConsumerConfig::default()).unwrap();

    assert_eq!(consumer.object_count(), 5);
    let kinds: Vec<_> = (0..5).map(|id| consumer.kind_of(id).unwrap()).collect();
    assert_eq!(
        kinds,
        [
            ObjectKind::Mesh,
            ObjectKind::Points,
            ObjectKind::Arrows,
            ObjectKind::Lines,
            ObjectKind::Text
        ]
    );

    let mesh = consumer.snapshot(0).unwrap();
    assert_eq!(mesh.value("positions").unwrap().shape(), &[3, 3]);
    assert_eq!(mesh.value("positions").unwrap().dtype(), Dtype::F64);
    assert_eq!(mesh.value("cells").unwrap().as_i64s(), vec![3, 0, 1, 2]);
    assert!(mesh.value("colormap_field").unwrap().is_unset());

    let points = consumer.snapshot(1).unwrap();
    assert_eq!(points.value("positions").unwrap().shape(), &[7, 3]);
    assert!(!points.value("colormap_field").unwrap().is_unset());
    assert_eq!(points.value("point_size").unwrap().as_f64s(), vec![4.0]);

    let text = consumer.snapshot(4).unwrap();
    assert_eq!(text.value("content").unwrap().as_text(), "step 0");
    assert_eq!(text.value("corner").unwrap().as_text(), "TL");
    assert!(!text.value("bold").unwrap().as_bool());

    close(handle, consumer);
}

// The concrete scenario from the transport contract: one points object with
// 10 positions, 5 updates alternating which half moves, counter 1..=5,
// positions dirty on every step and nothing else, segments gone afterwards.
#[test]
fn points_session_step_sequence() {
    let mut producer = Producer::new(sync_config()).unwrap();
    let id = producer
        .add_points(Points {
            positions: vec![[0.0; 3]; 10],
            ..Default::default()
        })
        .unwrap();
    let segment_names = producer.segment_names();
    let port = producer.bind(None).unwrap();

    let handle = thread::spawn(move || {
        producer.connect().unwrap();
        for k in 1..=5u64 {
            let mut positions = vec![[0.0; 3]; 10];
            let moved = if k % 2 == 0 { 0..5 } else { 5..10 };
            for i in moved {
                positions[i] = [k as f64, 0.0, 0.0];
            }
            producer
                .update_points(
                    id,
                    PointsUpdate {
                        positions: Some(positions),
                        ..Default::default()
                    },
                )
                .unwrap();
            producer.step().unwrap();
        }
        producer
    });

    let mut consumer = Consumer::connect(port, ConsumerConfig::default()).unwrap();
    for k in 1..=5u64 {
        wait_for_frame(&mut consumer);
        assert_eq!(consumer.applied_step(), k);
        assert!(consumer.applied_step() <= consumer.step_count());

        let snapshot = consumer.snapshot(id).unwrap();
        assert!(snapshot.dirty("positions"));
        for name in ["color", "alpha", "point_size", "colormap_field"] {
            assert!(!snapshot.dirty(name), "field '{name}' dirty at step {k}");
        }
        let expected = if k % 2 == 0 {
            [k as f64, 0.0, 0.0]
        } else {
            [0.0, 0.0, 0.0]
        };
        assert_eq!(snapshot.value("positions").unwrap().as_vec3s()[0], expected);
    }

    close(handle, consumer);
    for name in segment_names {
        assert!(
            ShmSegment::open(&name).is_err(),
            "segment '{name}' still exists after shutdown"
        );
    }
}

#[test]
fn sync_step_blocks_until_acknowledgment() {
    let mut producer = Producer::new(sync_config()).unwrap();
    producer
        .add_points(Points {
            positions: vec![[0.0; 3]],
            ..Default::default()
        })
        .unwrap();
    let port = producer.bind(None).unwrap();

    let handle = thread::spawn(move || {
        producer.connect().unwrap();
        let t0 = Instant::now();
        producer.step().unwrap();
        (producer, t0.elapsed())
    });

    let mut consumer = Consumer::connect(port, ConsumerConfig::default()).unwrap();
    thread::sleep(Duration::from_millis(250));
    wait_for_frame(&mut consumer);

    let consumer_half = thread::spawn(move || consumer.shutdown().unwrap());
    let (mut producer, blocked_for) = handle.join().unwrap();
    producer.shutdown().unwrap();
    consumer_half.join().unwrap();

    assert!(
        blocked_for >= Duration::from_millis(200),
        "sync step returned after {blocked_for:?}, before the acknowledgment"
    );
}

#[test]
fn async_step_never_stalls_on_the_consumer() {
    // No consumer at all: the counter still advances and step() returns
    // within its pacing delay.
    let mut producer = Producer::new(ProducerConfig::default()).unwrap();
    producer
        .add_points(Points {
            positions: vec![[0.0; 3]],
            ..Default::default()
        })
        .unwrap();

    let t0 = Instant::now();
    assert_eq!(producer.step().unwrap(), 1);
    assert_eq!(producer.step().unwrap(), 2);
    assert_eq!(producer.step().unwrap(), 3);
    assert!(t0.elapsed() < Duration::from_millis(500));
    producer.shutdown().unwrap();
}

#[test]
fn ack_timeout_bounds_the_sync_wait() {
    let mut producer = Producer::new(ProducerConfig {
        sync: true,
        ack_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    })
    .unwrap();
    producer
        .add_points(Points {
            positions: vec![[0.0; 3]],
            ..Default::default()
        })
        .unwrap();
    let port = producer.bind(None).unwrap();

    let handle = thread::spawn(move || {
        producer.connect().unwrap();
        let result = producer.step();
        (producer, result)
    });

    // Connect but never tick, so the acknowledgment never comes.
    let mut consumer = Consumer::connect(port, ConsumerConfig::default()).unwrap();
    thread::sleep(Duration::from_millis(300));

    let consumer_half = thread::spawn(move || consumer.shutdown().unwrap());
    let (mut producer, result) = handle.join().unwrap();
    assert!(matches!(result, Err(SimlinkError::AckTimeout)));
    producer.shutdown().unwrap();
    consumer_half.join().unwrap();
}

#[test]
fn recorded_frames_play_back_deterministically() {
    let mut producer = Producer::new(sync_config()).unwrap();
    let id = producer
        .add_points(Points {
            positions: vec![[0.0; 3]; 2],
            ..Default::default()
        })
        .unwrap();
    let port = producer.bind(None).unwrap();

    let handle = thread::spawn(move || {
        producer.connect().unwrap();
        for k in 1..=3u64 {
            producer
                .update_points(
                    id,
                    PointsUpdate {
                        positions: Some(vec![[k as f64, 0.0, 0.0]; 2]),
                        ..Default::default()
                    },
                )
                .unwrap();
            producer.step().unwrap();
        }
        producer
    });

    let mut consumer = Consumer::connect(
        port,
        ConsumerConfig {
            record_history: true,
            ..Default::default()
        },
    )
    .unwrap();
    for _ in 0..3 {
        wait_for_frame(&mut consumer);
    }

    assert_eq!(consumer.frame_count(), 3);
    for k in 1..=3usize {
        let frame = consumer.snapshot_at(id, k - 1).unwrap();
        assert_eq!(
            frame.value("positions").unwrap().as_vec3s(),
            vec![[k as f64, 0.0, 0.0]; 2]
        );
    }
    assert!(consumer.snapshot_at(id, 3).is_err());

    close(handle, consumer);
}

#[derive(Default)]
struct RecordingSurface {
    events: Vec<(&'static str, usize, Vec<usize>)>,
}

impl Surface for RecordingSurface {
    fn attach(&mut self, source: usize, object_ids: &[usize]) {
        self.events.push(("attach", source, object_ids.to_vec()));
    }

    fn detach(&mut self, source: usize, object_ids: &[usize]) {
        self.events.push(("detach", source, object_ids.to_vec()));
    }
}

#[test]
fn batch_sources_switch_and_stay_isolated() {
    let ports = allocate_ports(2).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for (index, &port) in ports.iter().enumerate() {
        let stop = Arc::clone(&stop);
        // The first producer asks for sync mode to exercise the silent
        // batch downgrade; both must end up stepping without blocking.
        let mut producer = Producer::new(ProducerConfig {
            sync: index == 0,
            ..Default::default()
        })
        .unwrap();
        producer
            .add_points(Points {
                positions: vec![[0.0; 3]; 3],
                ..Default::default()
            })
            .unwrap();
        if index == 1 {
            producer
                .add_text(Text {
                    content: "source 1".into(),
                    ..Default::default()
                })
                .unwrap();
        }
        assert_eq!(producer.bind(Some(port)).unwrap(), port);
        handles.push(thread::spawn(move || {
            producer.connect().unwrap();
            while !stop.load(Ordering::Acquire) {
                producer.step().unwrap();
            }
            producer.shutdown().unwrap();
        }));
    }

    let mut router = BatchRouter::connect(&ports, ConsumerConfig::default()).unwrap();
    assert_eq!(router.source_count(), 2);
    assert_eq!(router.active(), 0);

    let mut surface = RecordingSurface::default();
    router.attach(0, &mut surface).unwrap();
    assert_eq!(surface.events, vec![("attach", 0, vec![0])]);

    // Both counters advance while source 0 is displayed.
    let before = (
        router.consumer(0).unwrap().step_count(),
        router.consumer(1).unwrap().step_count(),
    );
    thread::sleep(Duration::from_millis(100));
    router.tick_all();
    assert!(router.consumer(0).unwrap().step_count() > before.0);
    assert!(router.consumer(1).unwrap().step_count() > before.1);

    // Switching detaches exactly source 0's set and attaches source 1's.
    router.set_active(1, &mut surface).unwrap();
    assert_eq!(
        surface.events[1..],
        [("detach", 0, vec![0]), ("attach", 1, vec![0, 1])]
    );
    assert!(matches!(
        router.set_active(5, &mut surface),
        Err(SimlinkError::UnknownSource(5))
    ));

    // Source 0 keeps synchronizing after losing the display.
    let before = router.consumer(0).unwrap().step_count();
    thread::sleep(Duration::from_millis(100));
    router.tick_all();
    assert!(router.consumer(0).unwrap().step_count() > before);

    stop.store(true, Ordering::Release);
    let deadline = Instant::now() + Duration::from_secs(5);
    while router.is_alive(0) || router.is_alive(1) {
        assert!(Instant::now() < deadline, "batch sources did not shut down");
        router.tick_all();
        thread::sleep(Duration::from_millis(20));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
