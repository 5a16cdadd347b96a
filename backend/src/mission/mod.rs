pub mod ack;
pub mod engine;
pub mod event;
pub mod item;

pub use engine::{Effect, EngineConfig, MissionEngine, PendingTimer, SessionId, TimerKind};
pub use event::{InboundMessage, MissionEvent, MissionMessage, OutboundMessage};
