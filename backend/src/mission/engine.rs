//! Mission upload / clear state machine.
//!
//! The engine is synchronous and owns no I/O. Every entry point takes the
//! current time and returns the effects the caller must carry out, in order.
//! Timeouts are requested through [`MissionEngine::pending_timer`] and
//! delivered back through [`MissionEngine::on_timer`].

use crate::error::{MissionError, TimeoutPhase};
use crate::mission::ack::MissionAck;
use crate::mission::event::{InboundMessage, MissionEvent, MissionMessage, OutboundMessage};
use crate::mission::item::{validate_waypoints, ItemVariant, MissionItem};
use gcs_shared::{
    MissionCommand, MissionProgress, MissionState, StatusDetails, StatusEvent, Waypoint,
};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_ACCEPT_GRACE: Duration = Duration::from_millis(3_000);

const BROADCAST_SYSTEM: i64 = 0;
const LEGACY_GCS_BROADCAST: i64 = 255;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Vehicle the mission is addressed to.
    pub target_system: u8,
    pub target_component: u8,
    /// Our own system id; requests addressed to it are ours.
    pub gcs_system_id: u8,
    pub response_timeout: Duration,
    pub accept_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_system: 1,
            target_component: 1,
            gcs_system_id: 255,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            accept_grace: DEFAULT_ACCEPT_GRACE,
        }
    }
}

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Vehicle went quiet mid-exchange.
    Response,
    /// Post-accept hold-off before returning to idle.
    Grace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub session: SessionId,
    pub kind: TimerKind,
    pub deadline: Instant,
}

/// What the caller has to do after feeding the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(OutboundMessage),
    Status(StatusEvent),
    Progress(MissionProgress),
}

#[derive(Debug)]
struct Upload {
    id: SessionId,
    waypoints: Vec<Waypoint>,
    current_seq: usize,
    variant: Option<ItemVariant>,
}

#[derive(Debug)]
enum Session {
    Idle,
    Uploading(Upload),
    Clearing { id: SessionId },
    Settling { id: SessionId },
}

pub struct MissionEngine {
    config: EngineConfig,
    session: Session,
    next_id: SessionId,
    timer: Option<PendingTimer>,
}

impl MissionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            session: Session::Idle,
            next_id: 1,
            timer: None,
        }
    }

    pub fn state(&self) -> MissionState {
        match self.session {
            Session::Idle => MissionState::Idle,
            Session::Uploading(_) => MissionState::WaitingForRequest,
            Session::Clearing { .. } => MissionState::Clearing,
            Session::Settling { .. } => MissionState::Settling,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match &self.session {
            Session::Idle => None,
            Session::Uploading(up) => Some(up.id),
            Session::Clearing { id } | Session::Settling { id } => Some(*id),
        }
    }

    pub fn pending_timer(&self) -> Option<PendingTimer> {
        self.timer
    }

    pub fn handle_command(&mut self, cmd: MissionCommand, now: Instant) -> Vec<Effect> {
        match cmd {
            MissionCommand::UploadMission { waypoints } => self.start_upload(&waypoints, now),
            MissionCommand::ClearMission => self.start_clear(now),
        }
    }

    pub fn start_upload(&mut self, raw: &[Value], now: Instant) -> Vec<Effect> {
        if !matches!(self.session, Session::Idle) {
            tracing::warn!(
                "Mission upload refused: engine busy ({})",
                self.state().as_str()
            );
            return Vec::new();
        }

        let waypoints = match validate_waypoints(raw) {
            Ok(w) => w,
            Err(err) => {
                if let MissionError::InvalidWaypoint { index, found } = &err {
                    tracing::warn!("Waypoint {index} rejected: expected object, got {found}");
                }
                return vec![Effect::Status(failure_status(&err))];
            }
        };

        let id = self.allocate_id();
        let total = waypoints.len();
        self.session = Session::Uploading(Upload {
            id,
            waypoints,
            current_seq: 0,
            variant: None,
        });
        self.arm(id, TimerKind::Response, now);
        tracing::info!("Mission upload started: {total} waypoints (session {id})");

        vec![
            Effect::Send(self.outbound(MissionMessage::Count {
                count: total as u16,
            })),
            Effect::Progress(MissionProgress { sent: 0, total }),
        ]
    }

    pub fn start_clear(&mut self, now: Instant) -> Vec<Effect> {
        if !matches!(self.session, Session::Idle) {
            tracing::warn!(
                "Mission clear refused: engine busy ({})",
                self.state().as_str()
            );
            return Vec::new();
        }

        let id = self.allocate_id();
        self.session = Session::Clearing { id };
        self.arm(id, TimerKind::Response, now);
        tracing::info!("Mission clear started (session {id})");

        vec![Effect::Send(self.outbound(MissionMessage::ClearAll))]
    }

    pub fn handle_message(&mut self, msg: &InboundMessage, now: Instant) -> Vec<Effect> {
        match MissionEvent::classify(&msg.name, &msg.fields) {
            Some(event) => self.handle_event(event, now),
            None => Vec::new(),
        }
    }

    pub fn handle_event(&mut self, event: MissionEvent, now: Instant) -> Vec<Effect> {
        if !self.accepts_target(event.target_system()) {
            tracing::debug!("Ignoring mission traffic for another system: {event:?}");
            return Vec::new();
        }

        match event {
            MissionEvent::ItemRequest { seq, variant, .. } => self.on_item_request(seq, variant, now),
            MissionEvent::Ack { code, .. } => self.on_ack(MissionAck::from_code(code), now),
            MissionEvent::Other { .. } => Vec::new(),
        }
    }

    /// Delivers a timer firing. Stale, mismatched, or early firings do nothing.
    pub fn on_timer(&mut self, session: SessionId, kind: TimerKind, now: Instant) -> Vec<Effect> {
        let Some(timer) = self.timer else {
            return Vec::new();
        };
        if timer.session != session || timer.kind != kind || now < timer.deadline {
            tracing::debug!("Ignoring stale {kind:?} timer for session {session}");
            return Vec::new();
        }
        self.timer = None;

        match kind {
            TimerKind::Grace => {
                if matches!(self.session, Session::Settling { .. }) {
                    self.session = Session::Idle;
                }
                Vec::new()
            }
            TimerKind::Response => {
                let phase = match &self.session {
                    Session::Uploading(up) if up.current_seq == 0 => {
                        TimeoutPhase::AwaitingFirstRequest
                    }
                    Session::Uploading(up) => TimeoutPhase::MidUpload { seq: up.current_seq },
                    Session::Clearing { .. } => TimeoutPhase::Clearing,
                    _ => return Vec::new(),
                };
                tracing::warn!("Mission session {session} timed out ({phase:?})");
                self.finish(MissionError::Timeout { phase })
            }
        }
    }

    /// Drops any session and timer without emitting anything.
    pub fn shutdown(&mut self) {
        if let Some(id) = self.session_id() {
            tracing::info!("Mission engine shutting down, dropping session {id}");
        }
        self.timer = None;
        self.session = Session::Idle;
    }

    fn on_item_request(&mut self, seq: i64, requested: ItemVariant, now: Instant) -> Vec<Effect> {
        let Session::Uploading(upload) = &mut self.session else {
            tracing::debug!("Item request for seq {seq} outside an upload, ignoring");
            return Vec::new();
        };

        let total = upload.waypoints.len();
        let index = match usize::try_from(seq) {
            Ok(i) if i < total => i,
            _ => {
                tracing::warn!("Vehicle requested seq {seq} of a {total}-item mission, aborting");
                return self.finish(MissionError::InvalidSequence { seq });
            }
        };

        let variant = *upload.variant.get_or_insert(requested);
        if variant != requested {
            tracing::debug!(
                "Vehicle asked for {}, staying on {} for this session",
                requested.item_message(),
                variant.item_message()
            );
        }
        if index != upload.current_seq {
            tracing::warn!(
                "Vehicle requested seq {index}, expected {}; following the vehicle",
                upload.current_seq
            );
        }

        let item = MissionItem::from_waypoint(&upload.waypoints[index], index as u16, variant);
        upload.current_seq = index + 1;
        let sent = upload.current_seq;
        let id = upload.id;
        self.arm(id, TimerKind::Response, now);

        vec![
            Effect::Send(self.outbound(MissionMessage::Item(item))),
            Effect::Progress(MissionProgress { sent, total }),
        ]
    }

    fn on_ack(&mut self, ack: MissionAck, now: Instant) -> Vec<Effect> {
        let (id, accepted) = match &self.session {
            Session::Uploading(up) => (
                up.id,
                StatusEvent::success("Mission uploaded successfully").with_details(StatusDetails {
                    waypoints: Some(up.waypoints.len()),
                    ..Default::default()
                }),
            ),
            Session::Clearing { id } => (*id, StatusEvent::success("Mission cleared successfully")),
            Session::Settling { .. } => {
                tracing::debug!("Duplicate MISSION_ACK during grace window, ignoring");
                return Vec::new();
            }
            Session::Idle => return Vec::new(),
        };
        self.timer = None;

        if !ack.is_accepted() {
            tracing::warn!("Vehicle rejected mission session {id}: {}", ack.name());
            return self.finish(MissionError::Rejected { ack });
        }

        tracing::info!("{}", accepted.message);
        self.session = Session::Settling { id };
        self.arm(id, TimerKind::Grace, now);
        vec![Effect::Status(accepted)]
    }

    fn finish(&mut self, err: MissionError) -> Vec<Effect> {
        self.timer = None;
        self.session = Session::Idle;
        vec![Effect::Status(failure_status(&err))]
    }

    fn accepts_target(&self, target: Option<i64>) -> bool {
        match target {
            None => true,
            Some(t) => {
                t == BROADCAST_SYSTEM
                    || t == LEGACY_GCS_BROADCAST
                    || t == i64::from(self.config.gcs_system_id)
                    || t == i64::from(self.config.target_system)
            }
        }
    }

    fn arm(&mut self, session: SessionId, kind: TimerKind, now: Instant) {
        let delay = match kind {
            TimerKind::Response => self.config.response_timeout,
            TimerKind::Grace => self.config.accept_grace,
        };
        self.timer = Some(PendingTimer {
            session,
            kind,
            deadline: now + delay,
        });
    }

    fn allocate_id(&mut self) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn outbound(&self, message: MissionMessage) -> OutboundMessage {
        OutboundMessage {
            message,
            target_system: self.config.target_system,
            target_component: self.config.target_component,
        }
    }
}

/// Status event for a failed session, with the details operators key on.
pub fn failure_status(err: &MissionError) -> StatusEvent {
    let details = match err {
        MissionError::InvalidSequence { seq } => StatusDetails {
            seq: Some(*seq),
            ..Default::default()
        },
        MissionError::Timeout {
            phase: TimeoutPhase::MidUpload { seq },
        } => StatusDetails {
            seq: Some(*seq as i64),
            ..Default::default()
        },
        MissionError::Rejected { ack } => StatusDetails {
            ack_type: Some(ack.code()),
            ack_type_name: Some(ack.name()),
            ..Default::default()
        },
        _ => StatusDetails::default(),
    };
    StatusEvent::failure(err.to_string()).with_details(details)
}
