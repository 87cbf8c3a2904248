//! Framing codec for the control socket
//!
//! The handshake and the steady-state acknowledgments share one tiny wire
//! format: every variable-length payload carries a 2-byte big-endian length
//! prefix, and all control exchanges use a fixed 4-byte token. A short read
//! or a bad token is never guessed around: it surfaces as `ProtocolDesync`
//! and the caller closes the connection.

use crate::error::{Result, SimlinkError};
use crate::field::Dtype;
use crate::kinds::ObjectKind;
use std::io::{Read, Write};

/// The 4-byte control token: handshake completion, per-step acknowledgment
/// and both halves of the shutdown exchange.
pub const TOKEN: [u8; 4] = *b"done";

pub(crate) fn write_u16(w: &mut impl Write, v: u16) -> Result<()> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub(crate) fn read_u16(r: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)
        .map_err(|e| SimlinkError::ProtocolDesync(format!("truncated length prefix: {e}")))?;
    Ok(u16::from_be_bytes(buf))
}

pub(crate) fn write_bytes(w: &mut impl Write, payload: &[u8]) -> Result<()> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    write_u16(w, payload.len() as u16)?;
    w.write_all(payload)?;
    Ok(())
}

pub(crate) fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|e| SimlinkError::ProtocolDesync(format!("truncated payload: {e}")))?;
    Ok(buf)
}

pub(crate) fn write_str(w: &mut impl Write, s: &str) -> Result<()> {
    write_bytes(w, s.as_bytes())
}

pub(crate) fn read_str(r: &mut impl Read) -> Result<String> {
    String::from_utf8(read_bytes(r)?)
        .map_err(|_| SimlinkError::ProtocolDesync("non-UTF-8 string payload".into()))
}

pub(crate) fn write_token(w: &mut impl Write) -> Result<()> {
    w.write_all(&TOKEN)?;
    Ok(())
}

pub(crate) fn read_token(r: &mut impl Read) -> Result<()> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| SimlinkError::ProtocolDesync(format!("truncated control token: {e}")))?;
    if buf != TOKEN {
        return Err(SimlinkError::ProtocolDesync(format!(
            "bad control token {buf:02x?}"
        )));
    }
    Ok(())
}

/// Shape blob: one big-endian u64 per dimension. Both ends of this
/// transport live in this crate, so no foreign encoding to match.
pub(crate) fn write_shape(w: &mut impl Write, shape: &[usize]) -> Result<()> {
    let mut blob = Vec::with_capacity(shape.len() * 8);
    for dim in shape {
        blob.extend_from_slice(&(*dim as u64).to_be_bytes());
    }
    write_bytes(w, &blob)
}

pub(crate) fn read_shape(r: &mut impl Read) -> Result<Vec<usize>> {
    let blob = read_bytes(r)?;
    if blob.len() % 8 != 0 {
        return Err(SimlinkError::ProtocolDesync(format!(
            "shape blob of {} bytes is not a multiple of 8",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(8)
        .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as usize)
        .collect())
}

/// Everything the consumer needs to map one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Data segment name; the dirty segment is always `"<segment>_dirty"`
    pub segment: String,
    /// Field name within the object
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

impl FieldSpec {
    pub(crate) fn encode(&self, w: &mut impl Write) -> Result<()> {
        write_str(w, &self.segment)?;
        write_str(w, &self.name)?;
        write_shape(w, &self.shape)?;
        write_str(w, self.dtype.as_str())
    }

    pub(crate) fn decode(r: &mut impl Read) -> Result<Self> {
        let segment = read_str(r)?;
        let name = read_str(r)?;
        let shape = read_shape(r)?;
        let dtype = Dtype::parse(&read_str(r)?)?;
        Ok(Self {
            segment,
            name,
            shape,
            dtype,
        })
    }
}

/// One object record as advertised during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSpec {
    pub kind: ObjectKind,
    pub fields: Vec<FieldSpec>,
}

impl ObjectSpec {
    pub(crate) fn encode(&self, w: &mut impl Write) -> Result<()> {
        write_str(w, self.kind.as_str())?;
        write_u16(w, self.fields.len() as u16)?;
        for field in &self.fields {
            field.encode(w)?;
        }
        Ok(())
    }

    pub(crate) fn decode(r: &mut impl Read) -> Result<Self> {
        let kind = ObjectKind::parse(&read_str(r)?)?;
        let count = read_u16(r)? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldSpec::decode(r)?);
        }
        Ok(Self { kind, fields })
    }
}

/// The full producer-to-consumer advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Name of the sync-state segment
    pub sync_segment: String,
    /// All object records, in id order
    pub objects: Vec<ObjectSpec>,
}

impl Handshake {
    pub(crate) fn encode(&self, w: &mut impl Write) -> Result<()> {
        write_str(w, &self.sync_segment)?;
        write_u16(w, self.objects.len() as u16)?;
        for object in &self.objects {
            object.encode(w)?;
        }
        w.flush()?;
        Ok(())
    }

    pub(crate) fn decode(r: &mut impl Read) -> Result<Self> {
        let sync_segment = read_str(r)?;
        let count = read_u16(r)? as usize;
        let mut objects = Vec::with_capacity(count);
        for _ in 0..count {
            objects.push(ObjectSpec::decode(r)?);
        }
        Ok(Self {
            sync_segment,
            objects,
        })
    }
}
