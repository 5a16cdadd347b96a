//! Mission-protocol messages in and out of the engine.

use crate::mission::item::{ItemVariant, MissionItem, MAV_MISSION_TYPE_MISSION};
use serde_json::{json, Map, Value};

/// Prefix shared by every message the engine cares about.
pub const MISSION_PREFIX: &str = "MISSION_";

/// One decoded message delivered by a link. Never mutated after hand-off.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub link: String,
    pub name: String,
    pub fields: Map<String, Value>,
    pub system_id: u8,
    pub component_id: u8,
}

/// Inbound traffic the state machine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionEvent {
    ItemRequest {
        seq: i64,
        variant: ItemVariant,
        target_system: Option<i64>,
    },
    Ack {
        code: i64,
        target_system: Option<i64>,
    },
    /// Mission-prefixed but not part of the upload exchange.
    Other { target_system: Option<i64> },
}

impl MissionEvent {
    /// `None` for anything outside the mission protocol.
    pub fn classify(name: &str, fields: &Map<String, Value>) -> Option<Self> {
        if !name.starts_with(MISSION_PREFIX) {
            return None;
        }

        let target_system = int_field(fields, &["target_system", "targetSystem"]);
        let event = match name {
            "MISSION_REQUEST" | "MISSION_REQUEST_INT" => {
                let variant = if name == "MISSION_REQUEST_INT" {
                    ItemVariant::Int
                } else {
                    ItemVariant::Float
                };
                match int_field(fields, &["seq"]) {
                    Some(seq) => MissionEvent::ItemRequest {
                        seq,
                        variant,
                        target_system,
                    },
                    None => {
                        tracing::warn!("{name} without a usable seq field, ignoring");
                        MissionEvent::Other { target_system }
                    }
                }
            }
            "MISSION_ACK" => match int_field(fields, &["type", "mavtype"]) {
                Some(code) => MissionEvent::Ack {
                    code,
                    target_system,
                },
                None => {
                    tracing::warn!("MISSION_ACK without a usable type field, ignoring");
                    MissionEvent::Other { target_system }
                }
            },
            _ => MissionEvent::Other { target_system },
        };
        Some(event)
    }

    pub fn target_system(&self) -> Option<i64> {
        match self {
            MissionEvent::ItemRequest { target_system, .. }
            | MissionEvent::Ack { target_system, .. }
            | MissionEvent::Other { target_system } => *target_system,
        }
    }
}

fn int_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .find_map(|v| v.as_i64().or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)))
}

/// Messages the engine asks the link to transmit.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionMessage {
    Count { count: u16 },
    Item(MissionItem),
    ClearAll,
}

impl MissionMessage {
    pub fn name(&self) -> &'static str {
        match self {
            MissionMessage::Count { .. } => "MISSION_COUNT",
            MissionMessage::Item(item) => item.variant().item_message(),
            MissionMessage::ClearAll => "MISSION_CLEAR_ALL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message: MissionMessage,
    pub target_system: u8,
    pub target_component: u8,
}

impl OutboundMessage {
    pub fn name(&self) -> &'static str {
        self.message.name()
    }

    /// Field map using the dialect's field names.
    pub fn fields(&self) -> Map<String, Value> {
        let fields = match &self.message {
            MissionMessage::Item(item) => {
                return item.to_fields(self.target_system, self.target_component);
            }
            MissionMessage::Count { count } => json!({
                "target_system": self.target_system,
                "target_component": self.target_component,
                "count": count,
                "mission_type": MAV_MISSION_TYPE_MISSION,
            }),
            MissionMessage::ClearAll => json!({
                "target_system": self.target_system,
                "target_component": self.target_component,
                "mission_type": MAV_MISSION_TYPE_MISSION,
            }),
        };
        match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}
