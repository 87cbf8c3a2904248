//! Shared fields: one named value plus its paired dirty flag
//!
//! Each field is backed by two POSIX shared memory segments: the data
//! segment holds the raw value bytes, and a same-named `"<segment>_dirty"`
//! one-byte segment holds the dirty flag. Shape, dtype and byte length are
//! fixed at creation; only the bytes are ever overwritten in place.
//!
//! The transport carries no lock. The producer publishes by copying the
//! bytes, issuing a release fence, then raising the dirty flag; the consumer
//! observes the flag with acquire ordering before copying the bytes out.

use crate::error::{Result, SimlinkError};
use crate::shm::{self, ShmSegment};
use crate::wire::FieldSpec;
use std::sync::atomic::{fence, AtomicU8, Ordering};

/// Primitive element types a field can carry
///
/// `U8` doubles as the boolean carrier (0/1 scalars); `Str` is a
/// fixed-capacity NUL-padded UTF-8 buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F64,
    I64,
    U8,
    Str,
}

impl Dtype {
    /// Stable tag used in the handshake
    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::F64 => "f64",
            Dtype::I64 => "i64",
            Dtype::U8 => "u8",
            Dtype::Str => "str",
        }
    }

    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "f64" => Ok(Dtype::F64),
            "i64" => Ok(Dtype::I64),
            "u8" => Ok(Dtype::U8),
            "str" => Ok(Dtype::Str),
            other => Err(SimlinkError::UnknownDtype(other.to_string())),
        }
    }

    /// Size of one element in bytes
    pub fn element_size(self) -> usize {
        match self {
            Dtype::F64 | Dtype::I64 => 8,
            Dtype::U8 | Dtype::Str => 1,
        }
    }
}

/// An owned field value: dtype, shape and native-endian bytes
///
/// A scalar (empty shape) holds exactly one element. A scalar NaN `f64` is
/// the placeholder for optional arrays that were never supplied (colormap
/// fields, texture coordinates): the segment still has to exist and be
/// sized at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl FieldValue {
    pub fn scalar_f64(v: f64) -> Self {
        Self {
            dtype: Dtype::F64,
            shape: Vec::new(),
            bytes: v.to_ne_bytes().to_vec(),
        }
    }

    pub fn f64s(values: &[f64]) -> Self {
        Self {
            dtype: Dtype::F64,
            shape: vec![values.len()],
            bytes: values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
        }
    }

    /// A `[n, 3]` array of positions or vectors
    pub fn vec3s(values: &[[f64; 3]]) -> Self {
        Self {
            dtype: Dtype::F64,
            shape: vec![values.len(), 3],
            bytes: values
                .iter()
                .flatten()
                .flat_map(|v| v.to_ne_bytes())
                .collect(),
        }
    }

    /// A `[n, 2]` array of texture coordinates
    pub fn vec2s(values: &[[f64; 2]]) -> Self {
        Self {
            dtype: Dtype::F64,
            shape: vec![values.len(), 2],
            bytes: values
                .iter()
                .flatten()
                .flat_map(|v| v.to_ne_bytes())
                .collect(),
        }
    }

    pub fn i64s(values: &[i64]) -> Self {
        Self {
            dtype: Dtype::I64,
            shape: vec![values.len()],
            bytes: values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
        }
    }

    /// A boolean scalar, carried as a single 0/1 byte
    pub fn flag(v: bool) -> Self {
        Self {
            dtype: Dtype::U8,
            shape: Vec::new(),
            bytes: vec![v as u8],
        }
    }

    /// A fixed-capacity UTF-8 string, NUL-padded to `capacity` bytes
    ///
    /// The caller (the kind schema layer) is responsible for rejecting
    /// strings longer than the capacity before building the value.
    pub(crate) fn text_padded(s: &str, capacity: usize) -> Self {
        let mut bytes = vec![0u8; capacity];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Self {
            dtype: Dtype::Str,
            shape: vec![capacity],
            bytes,
        }
    }

    /// The NaN-scalar placeholder for an optional array that was not supplied
    pub fn unset() -> Self {
        Self::scalar_f64(f64::NAN)
    }

    /// True if this value is the NaN-scalar placeholder
    pub fn is_unset(&self) -> bool {
        self.dtype == Dtype::F64 && self.shape.is_empty() && self.as_f64s()[0].is_nan()
    }

    pub(crate) fn from_raw(dtype: Dtype, shape: Vec<usize>, bytes: Vec<u8>) -> Self {
        Self {
            dtype,
            shape,
            bytes,
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of elements (product of extents; 1 for scalars)
    pub fn len(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// All elements as `f64`, in row-major order
    pub fn as_f64s(&self) -> Vec<f64> {
        self.bytes
            .chunks_exact(8)
            .map(|c| f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    }

    pub fn as_i64s(&self) -> Vec<i64> {
        self.bytes
            .chunks_exact(8)
            .map(|c| i64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    }

    /// Rows of a `[n, 3]` array
    pub fn as_vec3s(&self) -> Vec<[f64; 3]> {
        self.as_f64s().chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
    }

    pub fn as_bool(&self) -> bool {
        self.bytes.first().copied().unwrap_or(0) != 0
    }

    /// The string content with the NUL padding stripped
    pub fn as_text(&self) -> String {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.bytes.len());
        String::from_utf8_lossy(&self.bytes[..end]).into_owned()
    }
}

/// Producer-side shared field: owns both segment names
pub struct SharedField {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    data: ShmSegment,
    dirty: ShmSegment,
}

impl SharedField {
    /// Allocate the data and dirty segments and copy the initial value in
    ///
    /// Fails with `EmptyValue` on a zero-length value: a field that can
    /// never hold anything is a caller error, not something to retry.
    pub fn create(name: &str, value: &FieldValue) -> Result<Self> {
        if value.is_empty() {
            return Err(SimlinkError::EmptyValue {
                field: name.to_string(),
            });
        }

        let segment_name = shm::unique_name(name);
        let data = ShmSegment::create(&segment_name, value.bytes().len())?;
        let dirty = ShmSegment::create(&format!("{segment_name}_dirty"), 1)?;

        // Segments are zeroed at creation, so the dirty flag starts false.
        unsafe {
            std::ptr::copy_nonoverlapping(value.bytes().as_ptr(), data.as_ptr(), value.bytes().len());
        }

        Ok(Self {
            name: name.to_string(),
            dtype: value.dtype(),
            shape: value.shape().to_vec(),
            data,
            dirty,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field description for the handshake
    pub fn describe(&self) -> FieldSpec {
        FieldSpec {
            segment: self.data.name().to_string(),
            name: self.name.clone(),
            shape: self.shape.clone(),
            dtype: self.dtype,
        }
    }

    /// Overwrite the bytes in place and raise the dirty flag
    ///
    /// The value must match the creation dtype and byte length: segments are
    /// never resized.
    pub fn publish(&self, value: &FieldValue) -> Result<()> {
        if value.dtype() != self.dtype || value.bytes().len() != self.data.size() {
            return Err(SimlinkError::ShapeMismatch {
                field: self.name.clone(),
                expected: self.data.size(),
                got: value.bytes().len(),
            });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(value.bytes().as_ptr(), self.data.as_ptr(), value.bytes().len());
        }

        // The data bytes must be visible before the flag: this ordering is
        // the only synchronization the consumer gets.
        fence(Ordering::Release);
        self.dirty_flag().store(1, Ordering::Release);
        Ok(())
    }

    /// Lower the dirty flag without touching the bytes
    pub fn clear_dirty(&self) {
        self.dirty_flag().store(0, Ordering::Release);
    }

    /// Remove both segment names (idempotent)
    pub fn unlink(&mut self) {
        self.data.unlink();
        self.dirty.unlink();
    }

    fn dirty_flag(&self) -> &AtomicU8 {
        // SAFETY: the dirty segment is 1 byte, mapped for the life of self.
        unsafe { &*(self.dirty.as_ptr() as *const AtomicU8) }
    }
}

/// Consumer-side shared field: maps segments created by the producer
///
/// Only ever opens and unmaps; the producer owns the names.
pub struct RemoteField {
    spec: FieldSpec,
    data: ShmSegment,
    dirty: ShmSegment,
}

impl RemoteField {
    /// Map the data and dirty segments advertised during the handshake
    pub fn open(spec: FieldSpec) -> Result<Self> {
        let data = ShmSegment::open(&spec.segment)?;
        let dirty = ShmSegment::open(&format!("{}_dirty", spec.segment))?;

        let expected = spec.shape.iter().product::<usize>().max(1) * spec.dtype.element_size();
        if data.size() != expected {
            return Err(SimlinkError::ProtocolDesync(format!(
                "segment '{}' holds {} bytes, handshake advertised {}",
                spec.segment,
                data.size(),
                expected
            )));
        }

        Ok(Self { spec, data, dirty })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &FieldSpec {
        &self.spec
    }

    /// Copy the current bytes out as an owned value
    pub fn value(&self) -> FieldValue {
        fence(Ordering::Acquire);
        let mut bytes = vec![0u8; self.data.size()];
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.as_ptr(), bytes.as_mut_ptr(), bytes.len());
        }
        FieldValue::from_raw(self.spec.dtype, self.spec.shape.clone(), bytes)
    }

    /// Observe the dirty flag
    pub fn dirty(&self) -> bool {
        let flag = unsafe { &*(self.dirty.as_ptr() as *const AtomicU8) };
        flag.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_conversions() {
        let v = FieldValue::vec3s(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(v.shape(), &[2, 3]);
        assert_eq!(v.as_vec3s(), vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);

        let s = FieldValue::text_padded("green", 64);
        assert_eq!(s.bytes().len(), 64);
        assert_eq!(s.as_text(), "green");

        assert!(FieldValue::unset().is_unset());
        assert!(!FieldValue::scalar_f64(1.0).is_unset());
        assert!(FieldValue::flag(true).as_bool());
    }

    #[test]
    fn create_publish_observe() {
        let field = SharedField::create("positions", &FieldValue::f64s(&[1.0, 2.0])).unwrap();
        let remote = RemoteField::open(field.describe()).unwrap();

        assert!(!remote.dirty());
        assert_eq!(remote.value().as_f64s(), vec![1.0, 2.0]);

        field.publish(&FieldValue::f64s(&[3.0, 4.0])).unwrap();
        assert!(remote.dirty());
        assert_eq!(remote.value().as_f64s(), vec![3.0, 4.0]);

        field.clear_dirty();
        assert!(!remote.dirty());
    }

    #[test]
    fn empty_value_is_fatal() {
        let empty = FieldValue::f64s(&[]);
        assert!(matches!(
            SharedField::create("positions", &empty),
            Err(SimlinkError::EmptyValue { .. })
        ));
    }

    #[test]
    fn resize_is_rejected() {
        let field = SharedField::create("positions", &FieldValue::f64s(&[1.0, 2.0])).unwrap();
        let err = field.publish(&FieldValue::f64s(&[1.0, 2.0, 3.0])).unwrap_err();
        assert!(matches!(err, SimlinkError::ShapeMismatch { .. }));
    }

    #[test]
    fn unlink_removes_both_segments() {
        let mut field = SharedField::create("positions", &FieldValue::f64s(&[1.0])).unwrap();
        let spec = field.describe();
        field.unlink();
        field.unlink();
        assert!(RemoteField::open(spec).is_err());
    }
}
