//! Checkpoint record framing
//!
//! A checkpoint stream is a sequence of records. Each record is
//!
//! ```text
//! magic "EKCP" | version u16 LE | kind u8 | length u64 LE | JSON payload | SHA-256(payload)
//! ```
//!
//! The payload is the `serde_json` encoding of one value. Struct fields and
//! `BTreeMap` keys serialize in a fixed order, so equal states produce equal
//! bytes. Memory file contents are not records: they are written by the
//! memory files themselves between records.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"EKCP";
pub const VERSION: u16 = 1;

/// Payloads larger than this are rejected on read
pub const MAX_PAYLOAD: u64 = 1 << 30;

const DIGEST_LEN: usize = 32;

/// What a record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    CpuFeatures = 1,
    KernelState = 2,
    /// Owners of the private memory files that follow, in stream order
    PrivateMemoryFiles = 3,
}

impl RecordKind {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::CpuFeatures),
            2 => Some(RecordKind::KernelState),
            3 => Some(RecordKind::PrivateMemoryFiles),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::CpuFeatures => "cpu features",
            RecordKind::KernelState => "kernel state",
            RecordKind::PrivateMemoryFiles => "private memory files",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("bad record magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u16),

    #[error("expected {expected} record, found tag {found}")]
    UnexpectedRecord { expected: RecordKind, found: u8 },

    #[error("{0} record failed its integrity check")]
    DigestMismatch(RecordKind),

    #[error("failed to encode {kind} record: {message}")]
    Encode { kind: RecordKind, message: String },

    #[error("failed to decode {kind} record: {message}")]
    Decode { kind: RecordKind, message: String },

    #[error("{kind} record of {len} bytes exceeds the limit")]
    TooLarge { kind: RecordKind, len: u64 },
}

/// Writes `value` as one record of `kind`
pub fn write_record<T: Serialize>(
    w: &mut dyn Write,
    kind: RecordKind,
    value: &T,
) -> Result<(), CodecError> {
    let payload = serde_json::to_vec(value).map_err(|err| CodecError::Encode {
        kind,
        message: err.to_string(),
    })?;
    let len = payload.len() as u64;
    if len > MAX_PAYLOAD {
        return Err(CodecError::TooLarge { kind, len });
    }
    let digest = Sha256::digest(&payload);

    w.write_all(&MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&[kind as u8])?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&payload)?;
    w.write_all(&digest)?;
    Ok(())
}

/// Reads the next record, which must be of `kind`
pub fn read_record<T: DeserializeOwned>(
    r: &mut dyn Read,
    kind: RecordKind,
) -> Result<T, CodecError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let mut version = [0u8; 2];
    r.read_exact(&mut version)?;
    let version = u16::from_le_bytes(version);
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    if RecordKind::from_u8(tag[0]) != Some(kind) {
        return Err(CodecError::UnexpectedRecord {
            expected: kind,
            found: tag[0],
        });
    }
    let mut len = [0u8; 8];
    r.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len > MAX_PAYLOAD {
        return Err(CodecError::TooLarge { kind, len });
    }

    let mut payload = Vec::new();
    Read::take(&mut *r, len).read_to_end(&mut payload)?;
    if payload.len() as u64 != len {
        return Err(CodecError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} record truncated", kind),
        )));
    }
    let mut digest = [0u8; DIGEST_LEN];
    r.read_exact(&mut digest)?;
    if Sha256::digest(&payload).as_slice() != &digest[..] {
        return Err(CodecError::DigestMismatch(kind));
    }

    serde_json::from_slice(&payload).map_err(|err| CodecError::Decode {
        kind,
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_api::FeatureSet;
    use std::io::Cursor;

    fn encoded<T: Serialize>(kind: RecordKind, value: &T) -> Vec<u8> {
        let mut buf = Vec::new();
        write_record(&mut buf, kind, value).unwrap();
        buf
    }

    #[test]
    fn test_record_layout() {
        let buf = encoded(RecordKind::PrivateMemoryFiles, &vec!["a".to_string()]);
        assert_eq!(&buf[..4], b"EKCP");
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), VERSION);
        assert_eq!(buf[6], 3);
        let len = u64::from_le_bytes(buf[7..15].try_into().unwrap());
        assert_eq!(&buf[15..15 + len as usize], br#"["a"]"#);
        assert_eq!(buf.len(), 15 + len as usize + DIGEST_LEN);
    }

    #[test]
    fn test_records_read_in_sequence() {
        let features = FeatureSet::new("GenuineIntel", ["sse2", "avx"]);
        let mut buf = encoded(RecordKind::CpuFeatures, &features);
        buf.extend(encoded(RecordKind::KernelState, &42u32));

        let mut r = Cursor::new(buf);
        let read: FeatureSet = read_record(&mut r, RecordKind::CpuFeatures).unwrap();
        assert_eq!(read, features);
        let n: u32 = read_record(&mut r, RecordKind::KernelState).unwrap();
        assert_eq!(n, 42);
    }

    #[test]
    fn test_equal_values_encode_identically() {
        let a = FeatureSet::new("v", ["b", "a"]);
        let b = FeatureSet::new("v", ["a", "b"]);
        assert_eq!(
            encoded(RecordKind::CpuFeatures, &a),
            encoded(RecordKind::CpuFeatures, &b)
        );
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let buf = encoded(RecordKind::KernelState, &1u8);
        let err = read_record::<u8>(&mut Cursor::new(buf), RecordKind::CpuFeatures).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedRecord {
                expected: RecordKind::CpuFeatures,
                found: 2
            }
        ));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut buf = encoded(RecordKind::KernelState, &"payload");
        buf[16] ^= 0x01;
        let err = read_record::<String>(&mut Cursor::new(buf), RecordKind::KernelState).unwrap_err();
        assert!(matches!(err, CodecError::DigestMismatch(RecordKind::KernelState)));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut buf = encoded(RecordKind::KernelState, &0u8);
        buf[0] = b'X';
        assert!(matches!(
            read_record::<u8>(&mut Cursor::new(buf), RecordKind::KernelState),
            Err(CodecError::BadMagic(_))
        ));

        let mut buf = encoded(RecordKind::KernelState, &0u8);
        buf[4] = 9;
        assert!(matches!(
            read_record::<u8>(&mut Cursor::new(buf), RecordKind::KernelState),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_truncated_stream() {
        let buf = encoded(RecordKind::KernelState, &"some payload");
        let short = buf[..buf.len() - 40].to_vec();
        assert!(matches!(
            read_record::<String>(&mut Cursor::new(short), RecordKind::KernelState),
            Err(CodecError::Io(_))
        ));
    }
}
