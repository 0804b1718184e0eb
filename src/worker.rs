use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle to one identified backend connection, held by the vhost's pool.
///
/// `tx` delivers pre-serialized `RPC` frames to the connection task, which
/// writes them to the socket. The connection task owns the receiving half.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: Uuid,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub fn new(id: Uuid, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self { id, tx, cancel }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// READY workers in arrival order; `pop_front` is the round-robin cursor.
    idle: VecDeque<WorkerHandle>,
    /// BUSY workers, keyed by connection id, awaiting their `ACK`.
    busy: HashMap<Uuid, WorkerHandle>,
    /// RPC frames that arrived while no worker was READY.
    pending: VecDeque<String>,
}

/// Per-vhost RPC routing: round-robin over READY workers.
///
/// A worker delivered an RPC becomes BUSY and is eligible again only after
/// its explicit `ACK`. Requests arriving while every worker is BUSY (or the
/// pool is empty) queue in FIFO order and drain as workers come READY.
#[derive(Debug, Default)]
pub struct WorkerPool {
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly identified worker as READY, immediately handing it a
    /// queued RPC if one is waiting.
    pub async fn register(&self, worker: WorkerHandle) {
        let mut state = self.state.lock().await;
        state.idle.push_back(worker);
        Self::drain_pending(&mut state);
    }

    /// BUSY → READY on the worker's `ACK`. Returns `false` (and does
    /// nothing) if the worker was not BUSY — a stray `ACK` is ignored.
    pub async fn ack(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.busy.remove(&id) {
            Some(worker) => {
                state.idle.push_back(worker);
                Self::drain_pending(&mut state);
                true
            }
            None => false,
        }
    }

    /// Drop a disconnecting worker from the pool. Returns `true` if it was
    /// BUSY, in which case its in-flight RPC is lost (no retry).
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        if state.busy.remove(&id).is_some() {
            return true;
        }
        state.idle.retain(|w| w.id != id);
        false
    }

    /// Route one RPC frame to exactly one worker, or queue it when none is
    /// READY. Dead READY workers discovered here are cancelled and skipped.
    pub async fn dispatch(&self, frame: String) {
        let mut state = self.state.lock().await;
        Self::deliver(&mut state, frame);
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    pub async fn busy_count(&self) -> usize {
        self.state.lock().await.busy.len()
    }

    fn deliver(state: &mut PoolState, frame: String) {
        let mut frame = frame;
        while let Some(worker) = state.idle.pop_front() {
            match worker.tx.try_send(frame) {
                Ok(()) => {
                    state.busy.insert(worker.id, worker);
                    return;
                }
                Err(e) => {
                    // A full or closed queue means the connection is wedged
                    // or already gone; reclaim the frame and move on.
                    tracing::debug!(worker = %worker.id, "dropping unresponsive READY worker");
                    worker.cancel.cancel();
                    frame = match e {
                        mpsc::error::TrySendError::Full(f)
                        | mpsc::error::TrySendError::Closed(f) => f,
                    };
                }
            }
        }
        state.pending.push_back(frame);
    }

    fn drain_pending(state: &mut PoolState) {
        while !state.idle.is_empty() {
            let Some(frame) = state.pending.pop_front() else {
                break;
            };
            Self::deliver(state, frame);
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
