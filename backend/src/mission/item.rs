//! Waypoint validation and the MISSION_ITEM / MISSION_ITEM_INT wire form.

use crate::error::MissionError;
use gcs_shared::Waypoint;
use serde_json::{json, Map, Value};

/// The sequence field is one byte on the vehicles we talk to.
pub const MAX_WAYPOINTS: usize = 255;

pub const MAV_FRAME_GLOBAL_RELATIVE_ALT: u8 = 3;
pub const MAV_CMD_NAV_WAYPOINT: u16 = 16;
pub const MAV_MISSION_TYPE_MISSION: u8 = 0;

const DEFAULT_HOLD_TIME_S: f32 = 0.0;
const DEFAULT_ACCEPT_RADIUS_M: f32 = 2.0;
const DEFAULT_PASS_RADIUS_M: f32 = 0.0;

/// Which item message the vehicle asked for. Locked per session by the first request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemVariant {
    /// MISSION_ITEM, float degrees.
    Float,
    /// MISSION_ITEM_INT, degrees * 1e7.
    Int,
}

impl ItemVariant {
    pub fn item_message(&self) -> &'static str {
        match self {
            ItemVariant::Float => "MISSION_ITEM",
            ItemVariant::Int => "MISSION_ITEM_INT",
        }
    }
}

/// Checks the raw caller list and turns it into waypoints.
pub fn validate_waypoints(raw: &[Value]) -> Result<Vec<Waypoint>, MissionError> {
    if raw.is_empty() {
        return Err(MissionError::EmptyMission);
    }
    if raw.len() > MAX_WAYPOINTS {
        return Err(MissionError::TooManyWaypoints { count: raw.len() });
    }

    raw.iter()
        .enumerate()
        .map(|(index, value)| {
            if !value.is_object() {
                return Err(MissionError::InvalidWaypoint {
                    index,
                    found: json_kind(value),
                });
            }
            serde_json::from_value::<Waypoint>(value.clone()).map_err(|_| {
                MissionError::InvalidWaypoint {
                    index,
                    found: "malformed object",
                }
            })
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Fixed-point coordinate, rounding half away from zero.
pub fn deg_to_e7(deg: f64) -> i32 {
    (deg * 1e7).round() as i32
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ItemPosition {
    Float { x: f32, y: f32, z: f32 },
    Int { x: i32, y: i32, z: f32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct MissionItem {
    pub seq: u16,
    pub frame: u8,
    pub command: u16,
    pub current: u8,
    pub autocontinue: u8,
    pub param1: f32,
    pub param2: f32,
    pub param3: f32,
    pub param4: f32,
    pub position: ItemPosition,
}

impl MissionItem {
    pub fn from_waypoint(wp: &Waypoint, seq: u16, variant: ItemVariant) -> Self {
        let lat = wp.lat.or(wp.x).unwrap_or(0.0);
        let lon = wp.lon.or(wp.y).unwrap_or(0.0);
        let alt = wp.alt.or(wp.z).unwrap_or(0.0) as f32;

        let position = match variant {
            ItemVariant::Float => ItemPosition::Float {
                x: lat as f32,
                y: lon as f32,
                z: alt,
            },
            ItemVariant::Int => ItemPosition::Int {
                x: deg_to_e7(lat),
                y: deg_to_e7(lon),
                z: alt,
            },
        };

        Self {
            seq,
            frame: wp.frame.unwrap_or(MAV_FRAME_GLOBAL_RELATIVE_ALT),
            command: wp.command.unwrap_or(MAV_CMD_NAV_WAYPOINT),
            current: u8::from(seq == 0),
            autocontinue: u8::from(wp.autocontinue.unwrap_or(true)),
            param1: wp.param1.unwrap_or(DEFAULT_HOLD_TIME_S),
            param2: wp.param2.unwrap_or(DEFAULT_ACCEPT_RADIUS_M),
            param3: wp.param3.unwrap_or(DEFAULT_PASS_RADIUS_M),
            // NaN = keep current yaw
            param4: wp.param4.unwrap_or(f32::NAN),
            position,
        }
    }

    pub fn variant(&self) -> ItemVariant {
        match self.position {
            ItemPosition::Float { .. } => ItemVariant::Float,
            ItemPosition::Int { .. } => ItemVariant::Int,
        }
    }

    /// Dialect field map. Non-finite floats come out as `null`.
    pub fn to_fields(&self, target_system: u8, target_component: u8) -> Map<String, Value> {
        let (x, y, z) = match self.position {
            ItemPosition::Float { x, y, z } => (json!(x), json!(y), json!(z)),
            ItemPosition::Int { x, y, z } => (json!(x), json!(y), json!(z)),
        };

        let fields = json!({
            "target_system": target_system,
            "target_component": target_component,
            "seq": self.seq,
            "frame": self.frame,
            "command": self.command,
            "current": self.current,
            "autocontinue": self.autocontinue,
            "param1": self.param1,
            "param2": self.param2,
            "param3": self.param3,
            "param4": self.param4,
            "x": x,
            "y": y,
            "z": z,
            "mission_type": MAV_MISSION_TYPE_MISSION,
        });

        match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}
