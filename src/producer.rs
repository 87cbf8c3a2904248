//! Producer session: the simulation side of the transport
//!
//! The producer owns every shared memory segment of the session. It creates
//! the object records before the handshake, mutates their fields each step,
//! drives the sync state, and is the only side that ever unlinks a segment.

use crate::error::{Result, SimlinkError};
use crate::field::SharedField;
use crate::kinds::{
    Arrows, ArrowsUpdate, FieldSet, Lines, LinesUpdate, Mesh, MeshUpdate, ObjectKind, Points,
    PointsUpdate, Text, TextUpdate, UpdateSet,
};
use crate::sync::SyncState;
use crate::wire::{read_token, write_token, Handshake, ObjectSpec};
use log::{debug, warn};
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// Producer-side tuning knobs
#[derive(Clone)]
pub struct ProducerConfig {
    /// If true, `step()` blocks until the consumer acknowledges the frame;
    /// otherwise it sleeps `async_step_delay` and returns.
    pub sync: bool,
    /// Bound on the synchronous acknowledgment wait. `None` blocks forever;
    /// set a bound to surface `AckTimeout` instead of hanging when the
    /// consumer dies mid-frame.
    pub ack_timeout: Option<Duration>,
    /// Pacing delay of an asynchronous `step()`
    pub async_step_delay: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            sync: false,
            ack_timeout: None,
            async_step_delay: Duration::from_millis(2),
        }
    }
}

/// One drawable entity: a kind tag plus its ordered shared fields
struct ObjectRecord {
    kind: ObjectKind,
    fields: Vec<SharedField>,
}

impl ObjectRecord {
    fn create(kind: ObjectKind, set: FieldSet) -> Result<Self> {
        let mut fields = Vec::with_capacity(set.len());
        for (name, value) in &set {
            fields.push(SharedField::create(name, value)?);
        }
        Ok(Self { kind, fields })
    }

    fn describe(&self) -> ObjectSpec {
        ObjectSpec {
            kind: self.kind,
            fields: self.fields.iter().map(SharedField::describe).collect(),
        }
    }

    /// Clear every dirty flag, then publish exactly the supplied fields
    ///
    /// The clear-first order is what keeps dirtiness from one step from
    /// leaking into the next.
    fn apply(&mut self, id: usize, updates: UpdateSet) -> Result<()> {
        for field in &self.fields {
            field.clear_dirty();
        }
        for (name, value) in updates {
            let field = self
                .fields
                .iter()
                .find(|f| f.name() == name)
                .ok_or_else(|| SimlinkError::UnknownField {
                    id,
                    field: name.to_string(),
                })?;
            field.publish(&value)?;
        }
        Ok(())
    }

    fn unlink(&mut self) {
        for field in &mut self.fields {
            field.unlink();
        }
    }
}

/// The simulation-side registry and synchronization driver
///
/// Lifecycle: `new` → `add_*` → `bind` → `connect` → (`update_*` + `step`)*
/// → `shutdown`. The registry is sealed once `connect` runs; the field set
/// advertised in the handshake is immutable for the life of the connection.
pub struct Producer {
    config: ProducerConfig,
    objects: Vec<ObjectRecord>,
    sync_state: SyncState,
    listener: Option<TcpListener>,
    remote: Option<TcpStream>,
    /// Effective sync mode; batch mode downgrades `config.sync`
    sync_active: bool,
    sealed: bool,
    closed: bool,
}

impl Producer {
    pub fn new(config: ProducerConfig) -> Result<Self> {
        let sync_active = config.sync;
        Ok(Self {
            config,
            objects: Vec::new(),
            sync_state: SyncState::create()?,
            listener: None,
            remote: None,
            sync_active,
            sealed: false,
            closed: false,
        })
    }

    /// Bind the listening socket and return its port
    ///
    /// `batch_key` forces a pre-agreed port (batch mode); `None` lets the OS
    /// pick an ephemeral one. Synchronous stepping is unavailable in batch
    /// mode and is downgraded to async with a warning.
    pub fn bind(&mut self, batch_key: Option<u16>) -> Result<u16> {
        if batch_key.is_some() && self.sync_active {
            warn!("synchronous stepping is not available in batch mode, falling back to async");
            self.sync_active = false;
        }
        let listener = TcpListener::bind(("127.0.0.1", batch_key.unwrap_or(0)))?;
        let port = listener.local_addr()?.port();
        debug!("producer listening on port {port}");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Accept the consumer, send the handshake, and block until the consumer
    /// confirms every segment is mapped
    pub fn connect(&mut self) -> Result<()> {
        self.sealed = true;
        let listener = self
            .listener
            .take()
            .ok_or_else(|| SimlinkError::ProtocolDesync("connect() before bind()".into()))?;
        let (mut stream, peer) = listener.accept()?;
        debug!("consumer connected from {peer}");

        let handshake = Handshake {
            sync_segment: self.sync_state.name().to_string(),
            objects: self.objects.iter().map(ObjectRecord::describe).collect(),
        };
        handshake.encode(&mut stream)?;

        // The consumer answers with the 4-byte token once fully initialized;
        // the steady-state loop must not start before that.
        read_token(&mut stream)?;
        if self.sync_active {
            stream.set_read_timeout(self.config.ack_timeout)?;
        }
        self.remote = Some(stream);
        Ok(())
    }

    /// False once either side has requested shutdown
    pub fn is_open(&self) -> bool {
        self.sync_state.is_open()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Segment names owned by this session (sync state plus every field's
    /// data and dirty segment); diagnostic only
    pub fn segment_names(&self) -> Vec<String> {
        let mut names = vec![self.sync_state.name().to_string()];
        for object in &self.objects {
            for field in &object.fields {
                let segment = field.describe().segment;
                names.push(format!("{segment}_dirty"));
                names.push(segment);
            }
        }
        names
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> Result<usize> {
        self.add_object(ObjectKind::Mesh, mesh.into_fields()?)
    }

    pub fn add_points(&mut self, points: Points) -> Result<usize> {
        self.add_object(ObjectKind::Points, points.into_fields()?)
    }

    pub fn add_arrows(&mut self, arrows: Arrows) -> Result<usize> {
        self.add_object(ObjectKind::Arrows, arrows.into_fields()?)
    }

    pub fn add_lines(&mut self, lines: Lines) -> Result<usize> {
        self.add_object(ObjectKind::Lines, lines.into_fields()?)
    }

    pub fn add_text(&mut self, text: Text) -> Result<usize> {
        self.add_object(ObjectKind::Text, text.into_fields()?)
    }

    pub fn update_mesh(&mut self, id: usize, update: MeshUpdate) -> Result<()> {
        self.update_object(id, ObjectKind::Mesh, update.into_fields()?)
    }

    pub fn update_points(&mut self, id: usize, update: PointsUpdate) -> Result<()> {
        self.update_object(id, ObjectKind::Points, update.into_fields()?)
    }

    pub fn update_arrows(&mut self, id: usize, update: ArrowsUpdate) -> Result<()> {
        self.update_object(id, ObjectKind::Arrows, update.into_fields()?)
    }

    pub fn update_lines(&mut self, id: usize, update: LinesUpdate) -> Result<()> {
        self.update_object(id, ObjectKind::Lines, update.into_fields()?)
    }

    pub fn update_text(&mut self, id: usize, update: TextUpdate) -> Result<()> {
        self.update_object(id, ObjectKind::Text, update.into_fields()?)
    }

    fn add_object(&mut self, kind: ObjectKind, set: FieldSet) -> Result<usize> {
        if self.sealed {
            return Err(SimlinkError::RegistrySealed);
        }
        self.objects.push(ObjectRecord::create(kind, set)?);
        Ok(self.objects.len() - 1)
    }

    fn update_object(&mut self, id: usize, kind: ObjectKind, updates: UpdateSet) -> Result<()> {
        let record = self
            .objects
            .get_mut(id)
            .ok_or(SimlinkError::UnknownObject(id))?;
        if record.kind != kind {
            return Err(SimlinkError::KindMismatch {
                id,
                actual: record.kind.as_str(),
                called: kind.as_str(),
            });
        }
        record.apply(id, updates)
    }

    /// Advance the step counter and hand the frame to the consumer
    ///
    /// Synchronous mode raises the sync-request flag and blocks on the
    /// 4-byte acknowledgment; async mode just paces the loop and never
    /// stalls the simulation on rendering throughput.
    pub fn step(&mut self) -> Result<u64> {
        if self.sync_active {
            // The sync-request flag must be visible before the counter
            // increment that triggers the acknowledgment, or a consumer
            // ticking in between would apply the frame without ever acking.
            self.sync_state.set_sync_request(true);
            let step = self.sync_state.advance_step();
            let result = self.recv_ack();
            self.sync_state.set_sync_request(false);
            result?;
            Ok(step)
        } else {
            let step = self.sync_state.advance_step();
            std::thread::sleep(self.config.async_step_delay);
            Ok(step)
        }
    }

    fn recv_ack(&mut self) -> Result<()> {
        let stream = self
            .remote
            .as_mut()
            .ok_or_else(|| SimlinkError::ProtocolDesync("step() before connect()".into()))?;
        let mut buf = [0u8; 4];
        match stream.read_exact(&mut buf) {
            Ok(()) => Ok(()),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Err(SimlinkError::AckTimeout)
            }
            Err(e) => Err(SimlinkError::Io(e)),
        }
    }

    /// Bilateral shutdown: raise the exit flag, wait for the consumer to
    /// release its mappings, unlink every segment, then send the final token
    ///
    /// Idempotent; a second call returns immediately.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.sync_state.request_exit();

        if let Some(mut stream) = self.remote.take() {
            // The consumer closes its mappings, then sends its token. Only
            // after that is it safe to unlink the segments it had mapped.
            let _ = stream.set_read_timeout(None);
            match read_token(&mut stream) {
                Ok(()) => {
                    self.release_segments();
                    let _ = write_token(&mut stream);
                }
                Err(e) => {
                    // A dead consumer has nothing mapped anymore; release
                    // anyway instead of leaking the segments.
                    warn!("consumer did not acknowledge shutdown: {e}");
                    self.release_segments();
                }
            }
        } else {
            self.release_segments();
        }
        debug!("producer session closed");
        Ok(())
    }

    fn release_segments(&mut self) {
        for object in &mut self.objects {
            object.unlink();
        }
        self.sync_state.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmSegment;

    fn points_10() -> Points {
        Points {
            positions: vec![[0.0, 0.0, 0.0]; 10],
            ..Default::default()
        }
    }

    #[test]
    fn dense_ids() {
        let mut producer = Producer::new(ProducerConfig::default()).unwrap();
        assert_eq!(producer.add_points(points_10()).unwrap(), 0);
        assert_eq!(
            producer
                .add_text(Text {
                    content: "step 0".into(),
                    ..Default::default()
                })
                .unwrap(),
            1
        );
        assert_eq!(producer.object_count(), 2);
        producer.shutdown().unwrap();
    }

    #[test]
    fn kind_mismatch_names_the_right_method() {
        let mut producer = Producer::new(ProducerConfig::default()).unwrap();
        let id = producer.add_points(points_10()).unwrap();
        let err = producer.update_mesh(id, MeshUpdate::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Object {id} is kind 'points'; call update_points() instead of update_mesh()")
        );
        producer.shutdown().unwrap();
    }

    #[test]
    fn unknown_object() {
        let mut producer = Producer::new(ProducerConfig::default()).unwrap();
        assert!(matches!(
            producer.update_points(3, PointsUpdate::default()),
            Err(SimlinkError::UnknownObject(3))
        ));
        producer.shutdown().unwrap();
    }

    #[test]
    fn empty_positions_rejected() {
        let mut producer = Producer::new(ProducerConfig::default()).unwrap();
        assert!(matches!(
            producer.add_points(Points::default()),
            Err(SimlinkError::EmptyValue { .. })
        ));
        producer.shutdown().unwrap();
    }

    #[test]
    fn update_clears_stale_dirty_flags() {
        let mut producer = Producer::new(ProducerConfig::default()).unwrap();
        let id = producer.add_points(points_10()).unwrap();

        producer
            .update_points(
                id,
                PointsUpdate {
                    positions: Some(vec![[1.0, 0.0, 0.0]; 10]),
                    alpha: Some(0.5),
                    ..Default::default()
                },
            )
            .unwrap();

        let specs: Vec<_> = producer.objects[id]
            .fields
            .iter()
            .map(|f| f.describe())
            .collect();
        let dirty_of = |name: &str| {
            let spec = specs.iter().find(|s| s.name == name).unwrap();
            let seg = ShmSegment::open(&format!("{}_dirty", spec.segment)).unwrap();
            unsafe { *seg.as_ptr() != 0 }
        };
        assert!(dirty_of("positions"));
        assert!(dirty_of("alpha"));
        assert!(!dirty_of("color"));

        // The next step supplies only positions; alpha's dirtiness must not
        // leak forward.
        producer
            .update_points(
                id,
                PointsUpdate {
                    positions: Some(vec![[2.0, 0.0, 0.0]; 10]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(dirty_of("positions"));
        assert!(!dirty_of("alpha"));
        producer.shutdown().unwrap();
    }

    #[test]
    fn shutdown_without_consumer_unlinks_segments() {
        let mut producer = Producer::new(ProducerConfig::default()).unwrap();
        producer.add_points(points_10()).unwrap();
        let names = producer.segment_names();
        producer.shutdown().unwrap();
        producer.shutdown().unwrap();
        for name in names {
            assert!(ShmSegment::open(&name).is_err(), "segment '{name}' still exists");
        }
    }

    #[test]
    fn registry_seals_at_connect() {
        let mut producer = Producer::new(ProducerConfig::default()).unwrap();
        producer.add_points(points_10()).unwrap();
        producer.sealed = true;
        assert!(matches!(
            producer.add_points(points_10()),
            Err(SimlinkError::RegistrySealed)
        ));
        producer.shutdown().unwrap();
    }

    #[test]
    fn field_update_values_are_visible() {
        let mut producer = Producer::new(ProducerConfig::default()).unwrap();
        let id = producer.add_points(points_10()).unwrap();
        producer
            .update_points(
                id,
                PointsUpdate {
                    point_size: Some(8.0),
                    ..Default::default()
                },
            )
            .unwrap();
        let spec = producer.objects[id]
            .fields
            .iter()
            .find(|f| f.name() == "point_size")
            .unwrap()
            .describe();
        let remote = crate::field::RemoteField::open(spec).unwrap();
        assert_eq!(remote.value().as_f64s(), vec![8.0]);
        assert_eq!(remote.value().dtype(), crate::field::Dtype::F64);
        drop(remote);
        producer.shutdown().unwrap();
    }
}
