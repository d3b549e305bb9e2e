//! Replication protocol
//!
//! Serialization, framing and validation of the operation stream between
//! a primary and its secondaries.
//!
//! ## Wire Format
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┐
//! │ Length (4)   │  JSON body (compact)                     │
//! │ big-endian   │  {op_type, sequence, timestamp,          │
//! │              │   payload, checksum}                     │
//! └──────────────┴──────────────────────────────────────────┘
//! ```
//! Binary values travel base64-encoded inside the payload. The checksum
//! is the SHA-256 hex digest of the payload's canonical JSON encoding
//! (object keys sorted), so both ends compute it identically.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::now_ms;
use crate::error::{QuartzError, Result};

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame body size (100 MiB)
pub const MAX_FRAME_SIZE: u32 = 100 * 1024 * 1024;

// =============================================================================
// Operation Types
// =============================================================================

/// Kinds of operations carried by the replication stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Set,
    Delete,
    Metadata,
    Heartbeat,
    SyncRequest,
    SyncResponse,
}

/// One replicated operation.
///
/// `sequence` is strictly monotonic, assigned by the primary. The
/// payload shape depends on `op_type`; see the payload structs below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationOp {
    pub op_type: OpType,
    pub sequence: u64,
    /// Wall clock, informational only
    pub timestamp: i64,
    pub payload: serde_json::Value,
    /// SHA-256 hex over the canonical payload JSON
    pub checksum: String,
}

impl ReplicationOp {
    /// Build an operation, computing the payload checksum
    pub fn new<P: Serialize>(op_type: OpType, sequence: u64, payload: &P) -> Result<Self> {
        let payload = serde_json::to_value(payload)?;
        let checksum = payload_checksum(&payload);
        Ok(Self {
            op_type,
            sequence,
            timestamp: now_ms(),
            payload,
            checksum,
        })
    }

    /// Recompute and compare the payload checksum
    pub fn verify_checksum(&self) -> bool {
        payload_checksum(&self.payload) == self.checksum
    }

    /// Decode the payload into its typed form
    pub fn decode_payload<P: for<'de> Deserialize<'de>>(&self) -> Result<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// SHA-256 hex of the canonical JSON encoding of a payload.
///
/// `serde_json::Value` objects serialize with sorted keys, which makes
/// the encoding canonical on both ends of the wire.
pub fn payload_checksum(payload: &serde_json::Value) -> String {
    let canonical = payload.to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

// =============================================================================
// Typed Payloads
// =============================================================================

/// SET: full record for one key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPayload {
    pub db: String,
    pub namespace: String,
    pub key: String,
    /// base64-encoded value bytes
    pub value: String,
    pub tags: Vec<String>,
    pub ttl: Option<i64>,
}

impl SetPayload {
    pub fn new(
        db: &str,
        namespace: &str,
        key: &str,
        value: &[u8],
        tags: &[String],
        ttl: Option<i64>,
    ) -> Self {
        Self {
            db: db.to_string(),
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: BASE64.encode(value),
            tags: tags.to_vec(),
            ttl,
        }
    }

    /// Decode the base64 value back into bytes
    pub fn value_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.value)
            .map_err(|e| QuartzError::Protocol(format!("invalid base64 value: {}", e)))
    }
}

/// DELETE: key removal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePayload {
    pub db: String,
    pub namespace: String,
    pub key: String,
}

/// HEARTBEAT: primary liveness + latest sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub last_sequence: u64,
}

/// SYNC_REQUEST: secondary asks for everything after `from_sequence`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    pub from_sequence: u64,
}

/// SYNC_RESPONSE: primary's answer to a catch-up request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    pub status: SyncStatus,
    pub last_sequence: u64,
    /// Number of operations that follow this response
    pub operation_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Ok,
    /// Requested sequence predates the retained ring; the secondary must
    /// resync from a full backup
    OutOfRange,
}

// =============================================================================
// Framing
// =============================================================================

/// Write one length-prefixed frame
pub fn write_frame<W: Write>(writer: &mut W, op: &ReplicationOp) -> Result<()> {
    let body = serde_json::to_vec(op)?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(QuartzError::Protocol(format!(
            "frame of {} bytes exceeds maximum {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame, blocking until complete
pub fn read_frame<R: Read>(reader: &mut R) -> Result<ReplicationOp> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix)?;

    let length = u32::from_be_bytes(prefix);
    if length > MAX_FRAME_SIZE {
        return Err(QuartzError::Protocol(format!(
            "frame of {} bytes exceeds maximum {}",
            length, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body)?;

    let op: ReplicationOp = serde_json::from_slice(&body)?;
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let payload = SetPayload::new("db", "ns", "k", b"value bytes", &["t".to_string()], Some(60));
        let op = ReplicationOp::new(OpType::Set, 7, &payload).unwrap();

        let mut wire = Vec::new();
        write_frame(&mut wire, &op).unwrap();

        // 4-byte big-endian prefix matches the body length
        let body_len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(body_len, wire.len() - LENGTH_PREFIX_SIZE);

        let decoded = read_frame(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded.op_type, OpType::Set);
        assert_eq!(decoded.sequence, 7);
        assert!(decoded.verify_checksum());

        let round: SetPayload = decoded.decode_payload().unwrap();
        assert_eq!(round.value_bytes().unwrap(), b"value bytes");
        assert_eq!(round.ttl, Some(60));
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let payload = DeletePayload {
            db: "db".into(),
            namespace: "ns".into(),
            key: "k".into(),
        };
        let mut op = ReplicationOp::new(OpType::Delete, 1, &payload).unwrap();
        assert!(op.verify_checksum());

        op.payload["key"] = serde_json::Value::String("other".into());
        assert!(!op.verify_checksum());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        wire.extend_from_slice(b"junk");

        let err = read_frame(&mut wire.as_slice()).unwrap_err();
        assert!(matches!(err, QuartzError::Protocol(_)));
    }

    #[test]
    fn test_truncated_frame_is_an_io_error() {
        let payload = HeartbeatPayload { last_sequence: 3 };
        let op = ReplicationOp::new(OpType::Heartbeat, 0, &payload).unwrap();

        let mut wire = Vec::new();
        write_frame(&mut wire, &op).unwrap();
        wire.truncate(wire.len() - 2);

        let err = read_frame(&mut wire.as_slice()).unwrap_err();
        assert!(matches!(err, QuartzError::Io(_)));
    }
}
