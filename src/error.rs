//! Error types for simlink

use std::io;
use thiserror::Error;

/// Result type for simlink operations
pub type Result<T> = std::result::Result<T, SimlinkError>;

/// Errors that can occur in simlink operations
///
/// None of these are retried internally: every error is surfaced
/// synchronously to the caller that triggered it, and a failed session never
/// affects other batch sources.
#[derive(Debug, Error)]
pub enum SimlinkError {
    /// Failed to create a shared memory segment (a duplicate name lands here)
    #[error("Failed to create shared memory segment '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open an existing shared memory segment
    #[error("Failed to open shared memory segment '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map a segment
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to size a segment
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Segment name exceeds the OS limit
    #[error("Segment name too long: max {max} chars, got {got}")]
    SegmentNameTooLong { max: usize, got: usize },

    /// The producer's listening socket never accepted within the retry budget
    #[error("Producer socket on port {port} not ready after {attempts} attempts")]
    ConnectionNotReady { port: u16, attempts: usize },

    /// A field or object was created with a zero-length value
    #[error("Field '{field}' has a zero-length value")]
    EmptyValue { field: String },

    /// An update method was called for the wrong object kind
    #[error("Object {id} is kind '{actual}'; call update_{actual}() instead of update_{called}()")]
    KindMismatch {
        id: usize,
        actual: &'static str,
        called: &'static str,
    },

    /// Malformed or truncated framing on the control socket
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// An update value does not match the field's creation shape/dtype
    #[error("Field '{field}' expects {expected} bytes, got {got}")]
    ShapeMismatch {
        field: String,
        expected: usize,
        got: usize,
    },

    /// Object creation attempted after the handshake has started
    #[error("Registry is sealed: objects cannot be added after connect()")]
    RegistrySealed,

    /// No object with this id
    #[error("No object with id {0}")]
    UnknownObject(usize),

    /// No batch source with this index
    #[error("No batch source with index {0}")]
    UnknownSource(usize),

    /// Unrecognized kind tag in the handshake
    #[error("Unknown object kind '{0}'")]
    UnknownKind(String),

    /// Unrecognized dtype tag in the handshake
    #[error("Unknown dtype tag '{0}'")]
    UnknownDtype(String),

    /// No field with this name on the object
    #[error("Object {id} has no field '{field}'")]
    UnknownField { id: usize, field: String },

    /// Synchronous step() acknowledgment did not arrive within the configured bound
    #[error("Timed out waiting for the render acknowledgment")]
    AckTimeout,

    /// Socket I/O failure on the control channel
    #[error("Control socket error: {0}")]
    Io(#[from] io::Error),
}
