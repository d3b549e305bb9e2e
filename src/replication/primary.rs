//! Primary replicator
//!
//! Accepts secondary connections, broadcasts ordered operations, and
//! serves catch-up from a bounded in-memory operation ring.
//!
//! ## Architecture
//! - Accept thread: hands each new secondary its own reader + writer pair
//! - Per-replica writer thread: drains the replica's send queue
//! - Per-replica reader thread: handles SYNC_REQUESTs and ack heartbeats
//! - Maintenance thread: periodic heartbeats, stale-replica eviction
//!
//! Broadcast is enqueue-only; callers never block on a replica socket.
//! A replica that falls silent for 3x the heartbeat interval is dropped;
//! reconnecting is the replica's job.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::ReplicationConfig;
use crate::error::{QuartzError, Result};
use crate::replication::protocol::{
    read_frame, write_frame, DeletePayload, HeartbeatPayload, OpType, ReplicationOp, SetPayload,
    SyncRequestPayload, SyncResponsePayload, SyncStatus,
};

/// Counters and wiring for one connected secondary
struct ReplicaState {
    id: String,
    addr: SocketAddr,
    sender: Sender<ReplicationOp>,
    last_ack: AtomicU64,
    sent: AtomicU64,
    bytes_sent: AtomicU64,
    last_heard: Mutex<Instant>,
    connected: AtomicBool,
}

/// Per-replica statistics snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplicaStats {
    pub id: String,
    pub addr: String,
    pub last_ack: u64,
    pub sent: u64,
    pub bytes_sent: u64,
    pub connected: bool,
}

/// Replication primary: op ring + replica registry + TCP listener
pub struct PrimaryReplicator {
    sequence: AtomicU64,
    ring: Mutex<VecDeque<ReplicationOp>>,
    max_op_log: usize,
    replicas: Mutex<HashMap<String, Arc<ReplicaState>>>,
    heartbeat_interval: Duration,
    listen_addr: String,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PrimaryReplicator {
    pub fn new(config: &ReplicationConfig) -> Arc<Self> {
        Arc::new(Self {
            sequence: AtomicU64::new(0),
            ring: Mutex::new(VecDeque::new()),
            max_op_log: config.max_op_log.max(1),
            replicas: Mutex::new(HashMap::new()),
            heartbeat_interval: config.heartbeat_interval,
            listen_addr: config.listen_addr.clone(),
            local_addr: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listener and spawn the accept + maintenance threads
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).map_err(|e| {
            QuartzError::Backend(format!("failed to bind {}: {}", self.listen_addr, e))
        })?;
        listener.set_nonblocking(true)?;
        *self.local_addr.lock() = Some(listener.local_addr()?);

        tracing::info!(
            component = "replication",
            role = "primary",
            addr = %listener.local_addr()?,
            "replication listener started"
        );

        let accept_self = Arc::clone(self);
        let accept = thread::Builder::new()
            .name("quartzkv-repl-accept".to_string())
            .spawn(move || accept_self.accept_loop(listener))
            .map_err(|e| QuartzError::Backend(format!("failed to spawn accept thread: {}", e)))?;

        let maint_self = Arc::clone(self);
        let maintenance = thread::Builder::new()
            .name("quartzkv-repl-maint".to_string())
            .spawn(move || maint_self.maintenance_loop())
            .map_err(|e| QuartzError::Backend(format!("failed to spawn maintenance: {}", e)))?;

        let mut threads = self.threads.lock();
        threads.push(accept);
        threads.push(maintenance);
        Ok(())
    }

    /// Signal every thread, drop replica queues, and join
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.replicas.lock().clear();
        // Joining must not hold the thread registry lock: the accept
        // thread takes it while registering a replica
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!(component = "replication", role = "primary", "primary stopped");
    }

    /// Address the listener actually bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Latest assigned sequence number
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.lock().len()
    }

    pub fn replica_stats(&self) -> Vec<ReplicaStats> {
        self.replicas
            .lock()
            .values()
            .map(|r| ReplicaStats {
                id: r.id.clone(),
                addr: r.addr.to_string(),
                last_ack: r.last_ack.load(Ordering::Relaxed),
                sent: r.sent.load(Ordering::Relaxed),
                bytes_sent: r.bytes_sent.load(Ordering::Relaxed),
                connected: r.connected.load(Ordering::Relaxed),
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Broadcast
    // -------------------------------------------------------------------------

    /// Append a SET to the ring and enqueue it to every live replica
    pub fn broadcast_set(
        &self,
        db: &str,
        namespace: &str,
        key: &str,
        value: &[u8],
        tags: &[String],
        ttl: Option<i64>,
    ) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = SetPayload::new(db, namespace, key, value, tags, ttl);
        let op = ReplicationOp::new(OpType::Set, sequence, &payload)?;
        self.append_and_fan_out(op);
        Ok(())
    }

    /// Append a DELETE to the ring and enqueue it to every live replica
    pub fn broadcast_delete(&self, db: &str, namespace: &str, key: &str) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = DeletePayload {
            db: db.to_string(),
            namespace: namespace.to_string(),
            key: key.to_string(),
        };
        let op = ReplicationOp::new(OpType::Delete, sequence, &payload)?;
        self.append_and_fan_out(op);
        Ok(())
    }

    fn append_and_fan_out(&self, op: ReplicationOp) {
        {
            let mut ring = self.ring.lock();
            ring.push_back(op.clone());
            while ring.len() > self.max_op_log {
                ring.pop_front();
            }
        }

        for replica in self.replicas.lock().values() {
            if replica.connected.load(Ordering::Relaxed) {
                let _ = replica.sender.send(op.clone());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Accept / Maintenance Loops
    // -------------------------------------------------------------------------

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.register_replica(stream, addr) {
                        tracing::error!(
                            component = "replication",
                            role = "primary",
                            error = %e,
                            "failed to register replica"
                        );
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    if !self.shutdown.load(Ordering::Relaxed) {
                        tracing::error!(
                            component = "replication",
                            role = "primary",
                            error = %e,
                            "accept error"
                        );
                    }
                }
            }
        }
    }

    fn register_replica(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let replica_id = format!("replica-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let (sender, receiver) = unbounded::<ReplicationOp>();

        let state = Arc::new(ReplicaState {
            id: replica_id.clone(),
            addr,
            sender,
            last_ack: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            last_heard: Mutex::new(Instant::now()),
            connected: AtomicBool::new(true),
        });

        tracing::info!(
            component = "replication",
            role = "primary",
            replica = %replica_id,
            addr = %addr,
            "replica connected"
        );

        // Periodic read timeouts let the reader notice shutdown
        stream.set_read_timeout(Some(Duration::from_millis(500)))?;

        let write_stream = stream.try_clone()?;
        let writer_state = Arc::clone(&state);
        let writer_shutdown = Arc::clone(&self.shutdown);
        let writer = thread::Builder::new()
            .name(format!("quartzkv-repl-w-{}", replica_id))
            .spawn(move || Self::writer_loop(write_stream, writer_state, receiver, writer_shutdown))
            .map_err(|e| QuartzError::Backend(format!("failed to spawn writer: {}", e)))?;

        let reader_self = Arc::clone(self);
        let reader_state = Arc::clone(&state);
        let reader = thread::Builder::new()
            .name(format!("quartzkv-repl-r-{}", replica_id))
            .spawn(move || reader_self.reader_loop(stream, reader_state))
            .map_err(|e| QuartzError::Backend(format!("failed to spawn reader: {}", e)))?;

        self.replicas.lock().insert(replica_id, state);
        let mut threads = self.threads.lock();
        threads.push(writer);
        threads.push(reader);
        Ok(())
    }

    fn writer_loop(
        mut stream: TcpStream,
        state: Arc<ReplicaState>,
        receiver: Receiver<ReplicationOp>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) || !state.connected.load(Ordering::Relaxed) {
                break;
            }
            match receiver.recv_timeout(Duration::from_millis(200)) {
                Ok(op) => {
                    let body_len = serde_json::to_vec(&op).map(|b| b.len()).unwrap_or(0);
                    if let Err(e) = write_frame(&mut stream, &op) {
                        tracing::warn!(
                            component = "replication",
                            role = "primary",
                            replica = %state.id,
                            error = %e,
                            "send failed, marking replica degraded"
                        );
                        state.connected.store(false, Ordering::Relaxed);
                        break;
                    }
                    state.sent.fetch_add(1, Ordering::Relaxed);
                    state.bytes_sent.fetch_add(body_len as u64, Ordering::Relaxed);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn reader_loop(self: Arc<Self>, mut stream: TcpStream, state: Arc<ReplicaState>) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) || !state.connected.load(Ordering::Relaxed) {
                break;
            }
            let op = match read_frame(&mut stream) {
                Ok(op) => op,
                Err(QuartzError::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => {
                    state.connected.store(false, Ordering::Relaxed);
                    break;
                }
            };
            *state.last_heard.lock() = Instant::now();

            match op.op_type {
                OpType::SyncRequest => match op.decode_payload::<SyncRequestPayload>() {
                    Ok(request) => self.serve_catch_up(&state, request.from_sequence),
                    Err(e) => tracing::warn!(
                        component = "replication",
                        role = "primary",
                        replica = %state.id,
                        error = %e,
                        "malformed sync request"
                    ),
                },
                OpType::Heartbeat => {
                    if let Ok(hb) = op.decode_payload::<HeartbeatPayload>() {
                        state.last_ack.store(hb.last_sequence, Ordering::Relaxed);
                    }
                }
                other => tracing::debug!(
                    component = "replication",
                    role = "primary",
                    replica = %state.id,
                    op_type = ?other,
                    "ignoring unexpected inbound op"
                ),
            }
        }
    }

    /// Stream ring operations newer than `from_sequence` to one replica
    fn serve_catch_up(&self, state: &Arc<ReplicaState>, from_sequence: u64) {
        let (response, ops) = {
            let ring = self.ring.lock();
            let last_sequence = self.sequence.load(Ordering::SeqCst);
            let oldest = ring.front().map(|op| op.sequence);

            match oldest {
                // Ring has rotated past what the replica needs
                Some(oldest) if from_sequence + 1 < oldest => (
                    SyncResponsePayload {
                        status: SyncStatus::OutOfRange,
                        last_sequence,
                        operation_count: 0,
                    },
                    Vec::new(),
                ),
                _ => {
                    let ops: Vec<ReplicationOp> = ring
                        .iter()
                        .filter(|op| op.sequence > from_sequence)
                        .cloned()
                        .collect();
                    (
                        SyncResponsePayload {
                            status: SyncStatus::Ok,
                            last_sequence,
                            operation_count: ops.len() as u64,
                        },
                        ops,
                    )
                }
            }
        };

        tracing::info!(
            component = "replication",
            role = "primary",
            replica = %state.id,
            from_sequence,
            operations = response.operation_count,
            status = ?response.status,
            "serving catch-up"
        );

        if let Ok(op) = ReplicationOp::new(OpType::SyncResponse, self.last_sequence(), &response) {
            let _ = state.sender.send(op);
        }
        for op in ops {
            let _ = state.sender.send(op);
        }
    }

    fn maintenance_loop(self: Arc<Self>) {
        let mut last_heartbeat = Instant::now();
        let stale_after = self.heartbeat_interval * 3;

        while !self.shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(200));

            if last_heartbeat.elapsed() >= self.heartbeat_interval {
                let payload = HeartbeatPayload {
                    last_sequence: self.last_sequence(),
                };
                if let Ok(op) =
                    ReplicationOp::new(OpType::Heartbeat, self.last_sequence(), &payload)
                {
                    for replica in self.replicas.lock().values() {
                        if replica.connected.load(Ordering::Relaxed) {
                            let _ = replica.sender.send(op.clone());
                        }
                    }
                }
                last_heartbeat = Instant::now();
            }

            // Evict replicas that dropped or fell silent
            let mut replicas = self.replicas.lock();
            let dead: Vec<String> = replicas
                .values()
                .filter(|r| {
                    !r.connected.load(Ordering::Relaxed)
                        || r.last_heard.lock().elapsed() > stale_after
                })
                .map(|r| r.id.clone())
                .collect();
            for id in dead {
                if let Some(replica) = replicas.remove(&id) {
                    replica.connected.store(false, Ordering::Relaxed);
                    tracing::warn!(
                        component = "replication",
                        role = "primary",
                        replica = %id,
                        "removing stale replica"
                    );
                }
            }
        }
    }
}

impl Drop for PrimaryReplicator {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
