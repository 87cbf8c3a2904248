//! simlink - shared-memory transport between simulation and rendering processes
//!
//! This library decouples a numerical simulation loop from a graphical
//! rendering loop by running them in separate OS processes: per-step visual
//! state travels through POSIX shared memory, coordinated by a small
//! length-prefixed protocol on a loopback TCP socket.
//!
//! # Architecture
//!
//! - **Producer (simulation)**: creates the object records, mutates their
//!   fields each step, drives the step counter, owns segment lifetime
//! - **Consumer (render)**: reconstructs the records from the handshake,
//!   re-reads dirty fields each frame, only ever maps and unmaps
//! - **Batch router**: one render process mirroring several producers, one
//!   source attached to the display surface at a time
//!
//! No segment is guarded by a lock: correctness rests on single-writer /
//! single-reader discipline per field, monotonic step-counter semantics, and
//! write-data-before-set-dirty publication ordering.

pub mod batch;
pub mod consumer;
pub mod error;
pub mod field;
pub mod kinds;
pub mod producer;
pub mod shm;
pub mod sync;
pub mod wire;

pub use batch::{allocate_ports, BatchRouter, Surface};
pub use consumer::{Consumer, ConsumerConfig, ExitWatch, Snapshot};
pub use error::{Result, SimlinkError};
pub use field::{Dtype, FieldValue};
pub use kinds::{
    flatten_cells, group_cells, Arrows, ArrowsUpdate, Lines, LinesUpdate, Mesh, MeshUpdate,
    ObjectKind, Points, PointsUpdate, Text, TextUpdate,
};
pub use producer::{Producer, ProducerConfig};
