//! Replication Module
//!
//! Single-primary, multi-secondary replication over length-prefixed
//! framed messages.
//!
//! ## Architecture
//! - The primary assigns strictly monotonic sequence numbers, keeps a
//!   bounded in-memory ring of recent operations for catch-up, and
//!   broadcasts each write to every connected secondary
//! - Secondaries are read-only, apply the stream in order, verify
//!   checksums and sequence continuity, and reconnect with jittered
//!   exponential backoff
//! - Consistency is eventual; per-key and global order are preserved
//!   through the sequence numbers

pub mod protocol;

mod primary;
mod secondary;

pub use primary::{PrimaryReplicator, ReplicaStats};
pub use protocol::{
    DeletePayload, HeartbeatPayload, OpType, ReplicationOp, SetPayload, SyncRequestPayload,
    SyncResponsePayload, SyncStatus,
};
pub use secondary::SecondaryReplicator;
