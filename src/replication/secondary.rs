//! Secondary replicator
//!
//! Connects to the primary, catches up via SYNC_REQUEST, applies the
//! operation stream locally, and keeps serving reads while disconnected.
//!
//! ## Reconnection
//! Exponential backoff from 1 s to 30 s with +/-25% jitter, unbounded
//! retries. Every successful connect starts with a SYNC_REQUEST from the
//! last applied sequence, so in-flight operations lost at disconnect are
//! re-sent by the primary.
//!
//! ## Verification
//! Each data operation must pass its payload checksum and arrive at
//! exactly `last_applied + 1`. Corrupt frames are dropped and counted; a
//! sequence gap triggers a fresh SYNC_REQUEST. Applied operations are
//! never re-broadcast.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{QuartzError, Result};
use crate::replication::protocol::{
    read_frame, write_frame, HeartbeatPayload, OpType, ReplicationOp, SyncRequestPayload,
    SyncResponsePayload, SyncStatus,
};
use crate::store::Store;

/// Reconnect backoff bounds
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// How often the receive loop wakes to ack and check shutdown
const READ_TICK: Duration = Duration::from_millis(500);

/// Replication secondary: receive loop + local apply
pub struct SecondaryReplicator {
    primary_addr: String,
    store: Arc<Store>,
    shutdown: Arc<AtomicBool>,
    connected: AtomicBool,
    last_applied: AtomicU64,
    applied_count: AtomicU64,
    checksum_failures: AtomicU64,
    /// Set when the primary reported our sequence as out of range; the
    /// operator must restore this replica from a full backup
    needs_full_resync: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SecondaryReplicator {
    pub fn new(store: Arc<Store>, primary_addr: &str) -> Arc<Self> {
        Arc::new(Self {
            primary_addr: primary_addr.to_string(),
            store,
            shutdown: Arc::new(AtomicBool::new(false)),
            connected: AtomicBool::new(false),
            last_applied: AtomicU64::new(0),
            applied_count: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            needs_full_resync: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the receive thread. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("quartzkv-repl-secondary".to_string())
            .spawn(move || this.receive_loop())
            .map_err(|e| QuartzError::Backend(format!("failed to spawn receiver: {}", e)))?;
        *worker = Some(handle);

        tracing::info!(
            component = "replication",
            role = "secondary",
            primary = %self.primary_addr,
            "secondary replicator started"
        );
        Ok(())
    }

    /// Signal the receive loop and join it
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.connected.store(false, Ordering::Relaxed);
        tracing::info!(component = "replication", role = "secondary", "secondary stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Highest sequence applied locally
    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn applied_count(&self) -> u64 {
        self.applied_count.load(Ordering::Relaxed)
    }

    pub fn checksum_failures(&self) -> u64 {
        self.checksum_failures.load(Ordering::Relaxed)
    }

    /// True when catch-up fell off the primary's ring and only a full
    /// backup restore can bring this replica back
    pub fn needs_full_resync(&self) -> bool {
        self.needs_full_resync.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Receive Loop
    // -------------------------------------------------------------------------

    fn receive_loop(self: Arc<Self>) {
        let mut backoff = BACKOFF_INITIAL;

        while !self.shutdown.load(Ordering::Relaxed) {
            let stream = match TcpStream::connect(&self.primary_addr) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(
                        component = "replication",
                        role = "secondary",
                        primary = %self.primary_addr,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "connect failed, backing off"
                    );
                    self.sleep_with_jitter(backoff);
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            };

            backoff = BACKOFF_INITIAL;
            self.connected.store(true, Ordering::Relaxed);
            tracing::info!(
                component = "replication",
                role = "secondary",
                primary = %self.primary_addr,
                last_applied = self.last_applied(),
                "connected to primary"
            );

            if let Err(e) = self.run_session(stream) {
                tracing::warn!(
                    component = "replication",
                    role = "secondary",
                    error = %e,
                    "session ended, will reconnect"
                );
            }
            self.connected.store(false, Ordering::Relaxed);
        }
    }

    /// One connected session: sync request, then stream consumption
    fn run_session(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(READ_TICK))?;
        self.send_sync_request(&mut stream)?;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }

            let op = match read_frame(&mut stream) {
                Ok(op) => op,
                Err(QuartzError::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !op.verify_checksum() {
                self.checksum_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    component = "replication",
                    role = "secondary",
                    sequence = op.sequence,
                    "checksum mismatch, dropping frame and re-requesting"
                );
                self.send_sync_request(&mut stream)?;
                continue;
            }

            match op.op_type {
                OpType::Set | OpType::Delete | OpType::Metadata => {
                    self.handle_data_op(&mut stream, op)?;
                }
                OpType::Heartbeat => {
                    // Ack with our applied position
                    self.send_heartbeat(&mut stream)?;
                }
                OpType::SyncResponse => {
                    let response: SyncResponsePayload = op.decode_payload()?;
                    if response.status == SyncStatus::OutOfRange {
                        self.needs_full_resync.store(true, Ordering::Relaxed);
                        tracing::error!(
                            component = "replication",
                            role = "secondary",
                            last_applied = self.last_applied(),
                            primary_sequence = response.last_sequence,
                            "catch-up fell off the primary's operation ring; \
                             restore this replica from a full backup"
                        );
                    }
                }
                OpType::SyncRequest => {
                    tracing::debug!(
                        component = "replication",
                        role = "secondary",
                        "ignoring sync request sent to a secondary"
                    );
                }
            }
        }
    }

    fn handle_data_op(&self, stream: &mut TcpStream, op: ReplicationOp) -> Result<()> {
        let expected = self.last_applied.load(Ordering::SeqCst) + 1;

        if op.sequence < expected {
            // Duplicate from an overlapping catch-up; already applied
            return Ok(());
        }
        if op.sequence > expected {
            tracing::warn!(
                component = "replication",
                role = "secondary",
                expected,
                received = op.sequence,
                "sequence gap detected, re-requesting"
            );
            return self.send_sync_request(stream);
        }

        match self.store.apply_replicated(&op) {
            Ok(()) => {
                self.last_applied.store(op.sequence, Ordering::SeqCst);
                self.applied_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(
                    component = "replication",
                    role = "secondary",
                    sequence = op.sequence,
                    error = %e,
                    "failed to apply replicated operation"
                );
            }
        }
        Ok(())
    }

    fn send_sync_request(&self, stream: &mut TcpStream) -> Result<()> {
        let payload = SyncRequestPayload {
            from_sequence: self.last_applied(),
        };
        let op = ReplicationOp::new(OpType::SyncRequest, self.last_applied(), &payload)?;
        write_frame(stream, &op)
    }

    fn send_heartbeat(&self, stream: &mut TcpStream) -> Result<()> {
        let payload = HeartbeatPayload {
            last_sequence: self.last_applied(),
        };
        let op = ReplicationOp::new(OpType::Heartbeat, self.last_applied(), &payload)?;
        write_frame(stream, &op)
    }

    fn sleep_with_jitter(&self, backoff: Duration) {
        let factor = rand::thread_rng().gen_range(0.75..1.25);
        let jittered = backoff.mul_f64(factor);
        let deadline = std::time::Instant::now() + jittered;
        while std::time::Instant::now() < deadline {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for SecondaryReplicator {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
