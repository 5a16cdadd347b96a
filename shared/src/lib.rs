use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operator requests accepted by the ground station.
///
/// Wire shape: `{ "cmd": "upload_mission", "waypoints": [...] }` or
/// `{ "cmd": "clear_mission" }`. Waypoints stay raw JSON until the backend
/// validates them so a bad element can be reported by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum MissionCommand {
    UploadMission { waypoints: Vec<Value> },
    ClearMission,
}

/// One caller-supplied navigation point.
///
/// `lat`/`lon`/`alt` and `x`/`y`/`z` are interchangeable spellings; the first
/// one present wins. Everything except the position is optional and filled
/// with mission defaults when the item is built. Numeric fields also accept
/// numeric strings, and integer fields accept whole floats such as `3.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    #[serde(default, deserialize_with = "loose_f64")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "loose_f64")]
    pub lon: Option<f64>,
    #[serde(default, deserialize_with = "loose_f64")]
    pub alt: Option<f64>,
    #[serde(default, deserialize_with = "loose_f64")]
    pub x: Option<f64>,
    #[serde(default, deserialize_with = "loose_f64")]
    pub y: Option<f64>,
    #[serde(default, deserialize_with = "loose_f64")]
    pub z: Option<f64>,
    #[serde(default, deserialize_with = "loose_u8")]
    pub frame: Option<u8>,
    #[serde(default, deserialize_with = "loose_u16")]
    pub command: Option<u16>,
    #[serde(default, deserialize_with = "flag_from_json")]
    pub autocontinue: Option<bool>,
    #[serde(default, deserialize_with = "loose_f32")]
    pub param1: Option<f32>,
    #[serde(default, deserialize_with = "loose_f32")]
    pub param2: Option<f32>,
    #[serde(default, deserialize_with = "loose_f32")]
    pub param3: Option<f32>,
    #[serde(default, deserialize_with = "loose_f32")]
    pub param4: Option<f32>,
}

/// A JSON number or a string holding one; `null` reads as absent.
fn loose_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("{n} is not representable"))),
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(D::Error::custom(format!("expected a number, got {s:?}"))),
        },
        Some(other) => Err(D::Error::custom(format!("expected a number, got {other}"))),
    }
}

fn loose_integer<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: TryFrom<i64>,
{
    use serde::de::Error;

    match loose_number(deserializer)? {
        None => Ok(None),
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => T::try_from(v as i64)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("{v} out of range"))),
        Some(v) => Err(D::Error::custom(format!("expected an integer, got {v}"))),
    }
}

fn loose_f64<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    loose_number(d)
}

fn loose_f32<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<f32>, D::Error> {
    Ok(loose_number(d)?.map(|v| v as f32))
}

fn loose_u8<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<u8>, D::Error> {
    loose_integer(d)
}

fn loose_u16<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
    loose_integer(d)
}

/// Accepts `true`/`false` as well as the MAVLink-style `0`/`1`.
fn flag_from_json<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => Ok(Some(v != 0)),
            None => Err(D::Error::custom("autocontinue must be 0, 1, true or false")),
        },
        Some(other) => Err(D::Error::custom(format!(
            "autocontinue must be a flag, got {other}"
        ))),
    }
}

/// Engine state as seen by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionState {
    Idle,
    WaitingForRequest,
    Clearing,
    /// Accepted by the vehicle; holding off new sessions for the grace window.
    Settling,
}

impl MissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionState::Idle => "IDLE",
            MissionState::WaitingForRequest => "WAITING_FOR_REQUEST",
            MissionState::Clearing => "CLEARING",
            MissionState::Settling => "SETTLING",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waypoints: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_type: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_type_name: Option<String>,
}

impl StatusDetails {
    pub fn is_empty(&self) -> bool {
        *self == StatusDetails::default()
    }
}

/// Terminal (or validation) outcome of a mission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
}

impl StatusEvent {
    pub fn success<S: Into<String>>(message: S) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn failure<S: Into<String>>(message: S) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: StatusDetails) -> Self {
        self.details = (!details.is_empty()).then_some(details);
        self
    }
}

/// A status event as stored and replayed to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub timestamp_ms: i64,
    #[serde(flatten)]
    pub event: StatusEvent,
}

/// Items handed to the vehicle so far out of the mission total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionProgress {
    pub sent: usize,
    pub total: usize,
}

/// A vehicle message relayed to operators as it arrived.
///
/// `fields` uses the dialect's field names; mission messages and HEARTBEAT
/// carry enums as their numeric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub timestamp_ms: i64,
    pub link: String,
    pub name: String,
    pub system_id: u8,
    pub component_id: u8,
    pub fields: Map<String, Value>,
}

/// Operator request to put one dialect message on the link, e.g.
/// `{ "name": "PARAM_REQUEST_READ", "fields": { "target_system": 1, "param_index": 3 } }`.
/// Missing fields take the dialect default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upload_command_parses_from_tagged_json() {
        let cmd: MissionCommand = serde_json::from_value(json!({
            "cmd": "upload_mission",
            "waypoints": [{ "lat": 1.0, "lon": 2.0, "alt": 3.0 }]
        }))
        .expect("upload command should parse");

        match cmd {
            MissionCommand::UploadMission { waypoints } => assert_eq!(waypoints.len(), 1),
            other => panic!("unexpected command {other:?}"),
        }

        let clear: MissionCommand =
            serde_json::from_value(json!({ "cmd": "clear_mission" })).unwrap();
        assert_eq!(clear, MissionCommand::ClearMission);
    }

    #[test]
    fn autocontinue_accepts_numbers_and_bools() {
        let wp: Waypoint = serde_json::from_value(json!({ "autocontinue": 0 })).unwrap();
        assert_eq!(wp.autocontinue, Some(false));
        let wp: Waypoint = serde_json::from_value(json!({ "autocontinue": true })).unwrap();
        assert_eq!(wp.autocontinue, Some(true));
        assert!(serde_json::from_value::<Waypoint>(json!({ "autocontinue": "yes" })).is_err());
    }

    #[test]
    fn numeric_fields_tolerate_loose_json_types() {
        let wp: Waypoint = serde_json::from_value(json!({
            "lat": "47.1",
            "lon": 8,
            "alt": " 20.5 ",
            "frame": 3.0,
            "command": "16",
            "param4": null,
        }))
        .unwrap();
        assert_eq!(wp.lat, Some(47.1));
        assert_eq!(wp.lon, Some(8.0));
        assert_eq!(wp.alt, Some(20.5));
        assert_eq!(wp.frame, Some(3));
        assert_eq!(wp.command, Some(16));
        assert_eq!(wp.param4, None);

        assert!(serde_json::from_value::<Waypoint>(json!({ "frame": 3.5 })).is_err());
        assert!(serde_json::from_value::<Waypoint>(json!({ "frame": 300 })).is_err());
        assert!(serde_json::from_value::<Waypoint>(json!({ "lat": "north" })).is_err());
        assert!(serde_json::from_value::<Waypoint>(json!({ "lat": [1.0] })).is_err());
    }

    #[test]
    fn outgoing_message_fields_default_to_empty() {
        let msg: OutgoingMessage =
            serde_json::from_value(json!({ "name": "PARAM_REQUEST_LIST" })).unwrap();
        assert_eq!(msg.name, "PARAM_REQUEST_LIST");
        assert!(msg.fields.is_empty());
    }

    #[test]
    fn status_details_are_camel_case_and_omitted_when_empty() {
        let ev = StatusEvent::failure("Mission rejected: NO_SPACE").with_details(StatusDetails {
            ack_type: Some(4),
            ack_type_name: Some("NO_SPACE".into()),
            ..Default::default()
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["details"]["ackType"], 4);
        assert_eq!(v["details"]["ackTypeName"], "NO_SPACE");

        let plain = serde_json::to_value(StatusEvent::success("ok").with_details(StatusDetails::default()))
            .unwrap();
        assert!(plain.get("details").is_none());
    }

    #[test]
    fn status_record_flattens_the_event() {
        let rec = StatusRecord {
            timestamp_ms: 42,
            event: StatusEvent::success("Mission cleared successfully"),
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["timestamp_ms"], 42);
        assert_eq!(v["success"], true);
        assert_eq!(v["message"], "Mission cleared successfully");
    }
}
