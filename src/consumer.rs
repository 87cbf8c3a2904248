//! Consumer session: the render side of the transport
//!
//! The consumer reconstructs the object records from the handshake, maps
//! every segment the producer advertised, and observes the step counter each
//! frame. It only ever opens and unmaps segments; the producer owns their
//! lifetime.

use crate::error::{Result, SimlinkError};
use crate::field::{FieldValue, RemoteField};
use crate::kinds::ObjectKind;
use crate::sync::SyncState;
use crate::wire::{write_token, Handshake};
use log::debug;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Consumer-side tuning knobs
#[derive(Clone)]
pub struct ConsumerConfig {
    /// Connect retries while the producer's listener is not up yet;
    /// the default budget is ~5 s.
    pub connect_attempts: usize,
    pub connect_interval: Duration,
    /// Record every applied frame for later playback via `snapshot_at`
    pub record_history: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 500,
            connect_interval: Duration::from_millis(10),
            record_history: false,
        }
    }
}

/// Coarse polling interval of the exit watcher; the flag is in shared
/// memory, so there is no reason to hammer it.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct RemoteObject {
    kind: ObjectKind,
    fields: Vec<RemoteField>,
}

/// Field values and dirty flags of one object as of the last applied frame
#[derive(Clone)]
pub struct Snapshot {
    fields: Vec<(String, FieldValue, bool)>,
}

impl Snapshot {
    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, v, _)| v)
    }

    pub fn dirty(&self, name: &str) -> bool {
        self.fields
            .iter()
            .find(|(n, _, _)| n == name)
            .is_some_and(|(_, _, d)| *d)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _, _)| n.as_str())
    }
}

/// Background watcher polling the exit flag
///
/// Stops on drop; `exit_requested()` turns true once the flag is observed.
pub struct ExitWatch {
    observed: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ExitWatch {
    pub fn exit_requested(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }
}

impl Drop for ExitWatch {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The render-side registry and frame observer
pub struct Consumer {
    config: ConsumerConfig,
    objects: Vec<RemoteObject>,
    sync_state: Arc<SyncState>,
    stream: TcpStream,
    last_seen: u64,
    latest: Vec<Snapshot>,
    /// Applied frames, one `Vec<Snapshot>` per frame, when recording
    history: Vec<Vec<Snapshot>>,
    closed: bool,
}

impl Consumer {
    /// Connect to the producer on `port`, run the handshake, and map every
    /// advertised segment
    ///
    /// Retries the TCP connect while the producer's listener is not up yet;
    /// exhausting the budget surfaces `ConnectionNotReady`. The final
    /// `"done"` token is sent only after every segment is mapped, which is
    /// what the producer's `connect()` blocks on.
    pub fn connect(port: u16, config: ConsumerConfig) -> Result<Self> {
        let mut stream = Self::connect_with_retry(port, &config)?;

        let handshake = Handshake::decode(&mut stream)?;
        let sync_state = Arc::new(SyncState::open(&handshake.sync_segment)?);

        let mut objects = Vec::with_capacity(handshake.objects.len());
        for spec in handshake.objects {
            let mut fields = Vec::with_capacity(spec.fields.len());
            for field_spec in spec.fields {
                fields.push(RemoteField::open(field_spec)?);
            }
            objects.push(RemoteObject {
                kind: spec.kind,
                fields,
            });
        }

        let latest = objects.iter().map(Self::capture).collect();
        write_token(&mut stream)?;
        debug!("consumer mapped {} objects on port {port}", objects.len());

        Ok(Self {
            config,
            objects,
            sync_state,
            stream,
            last_seen: 0,
            latest,
            history: Vec::new(),
            closed: false,
        })
    }

    fn connect_with_retry(port: u16, config: &ConsumerConfig) -> Result<TcpStream> {
        for _ in 0..config.connect_attempts {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return Ok(stream),
                Err(_) => std::thread::sleep(config.connect_interval),
            }
        }
        Err(SimlinkError::ConnectionNotReady {
            port,
            attempts: config.connect_attempts,
        })
    }

    /// False once the exit handshake has completed
    pub fn is_open(&self) -> bool {
        !self.closed && self.sync_state.is_open()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn kind_of(&self, id: usize) -> Result<ObjectKind> {
        self.objects
            .get(id)
            .map(|o| o.kind)
            .ok_or(SimlinkError::UnknownObject(id))
    }

    /// Live step counter on the producer side
    pub fn step_count(&self) -> u64 {
        self.sync_state.step()
    }

    /// Last step applied by `frame_tick`; always ≤ `step_count()`
    pub fn applied_step(&self) -> u64 {
        self.last_seen
    }

    /// Number of frames recorded for playback
    pub fn frame_count(&self) -> usize {
        self.history.len()
    }

    /// Observe the step counter and apply any new frame
    ///
    /// Returns true if a new frame was applied. Last-value-wins: if several
    /// steps elapsed since the previous tick, only the current state is
    /// captured; intermediate steps are skipped, never queued. The 4-byte
    /// acknowledgment goes back only when the producer is blocked on it.
    pub fn frame_tick(&mut self) -> Result<bool> {
        let live = self.sync_state.step();
        if live <= self.last_seen {
            return Ok(false);
        }

        self.latest = self.objects.iter().map(Self::capture).collect();
        if self.config.record_history {
            self.history.push(self.latest.clone());
        }
        self.last_seen = live;

        if self.sync_state.sync_requested() {
            write_token(&mut self.stream)?;
        }
        Ok(true)
    }

    /// Values and dirty flags of one object as of the last `frame_tick`
    pub fn snapshot(&self, id: usize) -> Result<&Snapshot> {
        self.latest.get(id).ok_or(SimlinkError::UnknownObject(id))
    }

    /// A previously recorded frame, for deterministic playback
    pub fn snapshot_at(&self, id: usize, frame: usize) -> Result<&Snapshot> {
        let frame = self
            .history
            .get(frame)
            .ok_or_else(|| SimlinkError::ProtocolDesync(format!("no recorded frame {frame}")))?;
        frame.get(id).ok_or(SimlinkError::UnknownObject(id))
    }

    /// Spawn the background exit watcher
    pub fn watch_exit(&self) -> ExitWatch {
        let sync_state = Arc::clone(&self.sync_state);
        let observed = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let observed_in_thread = Arc::clone(&observed);
        let stop_in_thread = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_in_thread.load(Ordering::Acquire) {
                if sync_state.exit_requested() {
                    observed_in_thread.store(true, Ordering::Release);
                    break;
                }
                std::thread::sleep(EXIT_POLL_INTERVAL);
            }
        });
        ExitWatch {
            observed,
            stop,
            handle: Some(handle),
        }
    }

    /// Bilateral shutdown: raise the exit flag if this side decided to stop,
    /// release the mappings, then exchange the final tokens so the producer
    /// never unlinks memory this side still has mapped
    ///
    /// Idempotent; a second call returns immediately.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.sync_state.exit_requested() {
            self.sync_state.request_exit();
        }

        // Unmap before telling the producer it is safe to unlink.
        self.objects.clear();
        write_token(&mut self.stream)?;
        // The producer answers once it has unlinked everything; without
        // that token the session may leak segments on the producer side,
        // but this side is already safe to tear down.
        if let Err(e) = crate::wire::read_token(&mut self.stream) {
            log::warn!("producer did not complete the shutdown handshake: {e}");
        }
        debug!("consumer session closed");
        Ok(())
    }

    fn capture(object: &RemoteObject) -> Snapshot {
        Snapshot {
            fields: object
                .fields
                .iter()
                .map(|f| (f.name().to_string(), f.value(), f.dirty()))
                .collect(),
        }
    }
}
