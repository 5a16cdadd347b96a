use crate::mission::ack::MissionAck;
use mavlink::error::{MessageReadError, ParserError};

/// Why a mission session did not complete.
///
/// Every variant is local to one session: it is reported on the status
/// channel and the engine goes back to idle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MissionError {
    #[error("Empty waypoint array")]
    EmptyMission,

    #[error("Too many waypoints")]
    TooManyWaypoints { count: usize },

    #[error("Invalid waypoint data at index {index}")]
    InvalidWaypoint { index: usize, found: &'static str },

    #[error("Mission rejected: {}", .ack.name())]
    Rejected { ack: MissionAck },

    #[error("Invalid sequence number")]
    InvalidSequence { seq: i64 },

    #[error("{}", timeout_message(.phase))]
    Timeout { phase: TimeoutPhase },
}

/// Where in the exchange the vehicle went quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    AwaitingFirstRequest,
    MidUpload { seq: usize },
    Clearing,
}

fn timeout_message(phase: &TimeoutPhase) -> &'static str {
    match phase {
        TimeoutPhase::AwaitingFirstRequest => "Timeout waiting for vehicle response",
        TimeoutPhase::MidUpload { .. } => "Timeout during upload",
        TimeoutPhase::Clearing => "Timeout clearing mission",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    #[error("field {field} out of range: {value}")]
    FieldOutOfRange { field: &'static str, value: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message id {0}")]
    UnknownMessageId(u32),

    #[error("fields for {name} rejected: {reason}")]
    InvalidFields { name: String, reason: String },
}

impl From<MessageReadError> for CodecError {
    fn from(e: MessageReadError) -> Self {
        match e {
            MessageReadError::Parse(ParserError::UnknownMessage { id }) => {
                CodecError::UnknownMessageId(id)
            }
            other => CodecError::MalformedFrame(format!("{other:?}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link not connected")]
    Disconnected,

    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
