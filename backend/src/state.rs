use crate::ring_buffer::RingBuffer;
use crate::web::MissionStateMsg;
use gcs_shared::{
    MissionCommand, MissionProgress, MissionState, OutgoingMessage, StatusRecord, TelemetryMessage,
};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, Notify};

pub const RECENT_STATUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    /// Latest status events, newest last
    pub ring_buffer: Arc<Mutex<RingBuffer<StatusRecord>>>,

    /// Operator requests → mission task
    pub cmd_tx: mpsc::Sender<MissionCommand>,

    /// Operator-composed messages → link worker
    pub message_tx: mpsc::Sender<OutgoingMessage>,

    /// Decoded vehicle traffic → frontend
    pub telemetry_tx: broadcast::Sender<TelemetryMessage>,

    /// Session outcomes → frontend
    pub status_tx: broadcast::Sender<StatusRecord>,

    /// Upload progress → frontend
    pub progress_tx: broadcast::Sender<MissionProgress>,

    /// Engine state changes → frontend
    pub state_tx: broadcast::Sender<MissionStateMsg>,

    pub mission_state: Arc<Mutex<MissionState>>,

    /// SQLite database
    pub db: SqlitePool,

    pending_writes: Arc<AtomicUsize>,
    writes_done: Arc<Notify>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        cmd_tx: mpsc::Sender<MissionCommand>,
        message_tx: mpsc::Sender<OutgoingMessage>,
    ) -> Self {
        Self {
            ring_buffer: Arc::new(Mutex::new(RingBuffer::new(RECENT_STATUS_CAPACITY))),
            cmd_tx,
            message_tx,
            telemetry_tx: broadcast::channel(512).0,
            status_tx: broadcast::channel(256).0,
            progress_tx: broadcast::channel(256).0,
            state_tx: broadcast::channel(16).0,
            mission_state: Arc::new(Mutex::new(MissionState::Idle)),
            db,
            pending_writes: Arc::new(AtomicUsize::new(0)),
            writes_done: Arc::new(Notify::new()),
        }
    }

    pub fn mission_state(&self) -> MissionState {
        *self
            .mission_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the engine state and tells the frontend if it changed.
    pub fn set_mission_state(&self, next: MissionState) {
        let changed = {
            let mut current = self
                .mission_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = *current != next;
            *current = next;
            changed
        };
        if changed {
            let _ = self.state_tx.send(MissionStateMsg { state: next });
        }
    }

    pub fn push_recent(&self, record: StatusRecord) {
        self.ring_buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Up to `n` status events, newest first.
    pub fn recent_status(&self, n: usize) -> Vec<StatusRecord> {
        self.ring_buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(n)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn begin_db_write(&self) {
        self.pending_writes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_db_write(&self) {
        if self.pending_writes.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.writes_done.notify_waiters();
        }
    }

    /// Resolves once every spawned DB write has finished.
    pub async fn wait_for_db_writes(&self) {
        loop {
            let notified = self.writes_done.notified();
            if self.pending_writes.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
