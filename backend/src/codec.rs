//! MAVLink framing for the link task.
//!
//! The mission engine speaks in message names and field maps; this module turns
//! those into `common` dialect frames and back. Messages without a dedicated
//! mapping go through the dialect's serde form, so any `common` message can be
//! relayed or sent by name.

use crate::error::CodecError;
use mavlink::common::*;
use mavlink::error::MessageReadError;
use mavlink::peek_reader::PeekReader;
use mavlink::{MavHeader, MavlinkVersion, Message};
use num_traits::FromPrimitive;
use serde_json::{json, Map, Value};
use std::io::{Cursor, Read};

pub const MAV_STX_V1: u8 = 0xFE;
pub const MAV_STX_V2: u8 = 0xFD;

/// One frame pulled off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub name: String,
    pub fields: Map<String, Value>,
    pub system_id: u8,
    pub component_id: u8,
    pub sequence: u8,
}

pub trait MessageCodec: Send {
    fn encode(
        &mut self,
        name: &str,
        fields: &Map<String, Value>,
        system_id: u8,
        component_id: u8,
    ) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, CodecError>;
}

pub struct MavlinkCodec {
    version: MavlinkVersion,
    sequence: u8,
}

impl MavlinkCodec {
    pub fn new(version: MavlinkVersion) -> Self {
        Self {
            version,
            sequence: 0,
        }
    }

    /// Next valid frame of the configured version from a byte stream.
    ///
    /// Noise, frames with unknown incompat flags and frames failing their CRC
    /// are skipped one byte at a time, so a stray start byte never hides the
    /// frames behind it.
    pub fn read_message<R: Read>(
        &self,
        reader: &mut PeekReader<R>,
    ) -> Result<DecodedMessage, MessageReadError> {
        let (header, msg) = mavlink::read_versioned_msg::<MavMessage, _>(reader, mavlink::ReadVersion::Single(self.version))?;
        Ok(decoded(header, &msg))
    }
}

fn decoded(header: MavHeader, msg: &MavMessage) -> DecodedMessage {
    DecodedMessage {
        name: msg.message_name().to_string(),
        fields: message_fields(msg),
        system_id: header.system_id,
        component_id: header.component_id,
        sequence: header.sequence,
    }
}

/// Whether `name` is a message of the `common` dialect.
pub fn is_known_message(name: &str) -> bool {
    MavMessage::message_id_from_name(name).is_ok()
}

impl Default for MavlinkCodec {
    fn default() -> Self {
        Self::new(MavlinkVersion::V2)
    }
}

impl MessageCodec for MavlinkCodec {
    fn encode(
        &mut self,
        name: &str,
        fields: &Map<String, Value>,
        system_id: u8,
        component_id: u8,
    ) -> Result<Vec<u8>, CodecError> {
        let msg = build_message(name, fields)?;

        let header = MavHeader {
            system_id,
            component_id,
            sequence: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);

        let mut buf = Cursor::new(Vec::with_capacity(280));
        let written = match self.version {
            MavlinkVersion::V2 => mavlink::write_v2_msg(&mut buf, header, &msg),
            MavlinkVersion::V1 => mavlink::write_v1_msg(&mut buf, header, &msg),
        };
        written.map_err(|e| CodecError::MalformedFrame(format!("{e:?}")))?;
        Ok(buf.into_inner())
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, CodecError> {
        let version = match bytes.first() {
            Some(&MAV_STX_V1) => MavlinkVersion::V1,
            Some(&MAV_STX_V2) => MavlinkVersion::V2,
            _ => return Err(CodecError::MalformedFrame("missing start byte".into())),
        };

        let mut reader = PeekReader::new(bytes);
        let (header, msg) = mavlink::read_versioned_msg::<MavMessage, _>(&mut reader, mavlink::ReadVersion::Single(version))
            .map_err(CodecError::from)?;
        Ok(decoded(header, &msg))
    }
}

fn build_message(name: &str, f: &Map<String, Value>) -> Result<MavMessage, CodecError> {
    let msg = match name {
        "MISSION_COUNT" => MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            target_system: int(f, "target_system")?,
            target_component: int(f, "target_component")?,
            count: int(f, "count")?,
            mission_type: mission_type(f)?,
            ..Default::default()
        }),
        "MISSION_CLEAR_ALL" => MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
            target_system: int(f, "target_system")?,
            target_component: int(f, "target_component")?,
            mission_type: mission_type(f)?,
            ..Default::default()
        }),
        "MISSION_ITEM" => MavMessage::MISSION_ITEM(MISSION_ITEM_DATA {
            target_system: int(f, "target_system")?,
            target_component: int(f, "target_component")?,
            seq: int(f, "seq")?,
            frame: frame(f)?,
            command: command(f)?,
            current: int(f, "current")?,
            autocontinue: int(f, "autocontinue")?,
            param1: float(f, "param1")?,
            param2: float(f, "param2")?,
            param3: float(f, "param3")?,
            param4: float(f, "param4")?,
            x: float(f, "x")?,
            y: float(f, "y")?,
            z: float(f, "z")?,
            mission_type: mission_type(f)?,
            ..Default::default()
        }),
        "MISSION_ITEM_INT" => MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
            target_system: int(f, "target_system")?,
            target_component: int(f, "target_component")?,
            seq: int(f, "seq")?,
            frame: frame(f)?,
            command: command(f)?,
            current: int(f, "current")?,
            autocontinue: int(f, "autocontinue")?,
            param1: float(f, "param1")?,
            param2: float(f, "param2")?,
            param3: float(f, "param3")?,
            param4: float(f, "param4")?,
            x: int(f, "x")?,
            y: int(f, "y")?,
            z: float(f, "z")?,
            mission_type: mission_type(f)?,
            ..Default::default()
        }),
        "HEARTBEAT" => MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: int(f, "custom_mode")?,
            mavtype: enum_field(f, "type", MavType::from_u8)?,
            autopilot: enum_field(f, "autopilot", MavAutopilot::from_u8)?,
            base_mode: MavModeFlag::from_bits_truncate(int(f, "base_mode")?),
            system_status: enum_field(f, "system_status", MavState::from_u8)?,
            mavlink_version: int(f, "mavlink_version")?,
        }),
        other => dialect_message(other, f)?,
    };
    Ok(msg)
}

/// Any other `common` message: dialect defaults overlaid with the caller's
/// fields, keyed by the dialect's serde field names.
fn dialect_message(name: &str, f: &Map<String, Value>) -> Result<MavMessage, CodecError> {
    let unknown = |_| CodecError::UnknownMessage(name.to_string());
    let id = MavMessage::message_id_from_name(name).map_err(unknown)?;
    let base = MavMessage::default_message_from_id(id).map_err(unknown)?;

    let invalid = |e: serde_json::Error| CodecError::InvalidFields {
        name: name.to_string(),
        reason: e.to_string(),
    };
    let mut value = serde_json::to_value(&base).map_err(invalid)?;
    if let Value::Object(map) = &mut value {
        for (key, field) in f {
            if key == "type" || !map.contains_key(key) {
                tracing::debug!("{name}: ignoring unknown field {key}");
                continue;
            }
            map.insert(key.clone(), field.clone());
        }
    }
    serde_json::from_value(value).map_err(invalid)
}

fn out_of_range(field: &'static str, value: impl ToString) -> CodecError {
    CodecError::FieldOutOfRange {
        field,
        value: value.to_string(),
    }
}

/// Integer field; absent means 0.
fn int<T>(fields: &Map<String, Value>, field: &'static str) -> Result<T, CodecError>
where
    T: TryFrom<i64> + Default,
{
    match fields.get(field) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => {
            let raw = v.as_i64().ok_or_else(|| out_of_range(field, v))?;
            T::try_from(raw).map_err(|_| out_of_range(field, raw))
        }
    }
}

/// Float field; absent means 0, `null` means NaN.
fn float(fields: &Map<String, Value>, field: &'static str) -> Result<f32, CodecError> {
    match fields.get(field) {
        None => Ok(0.0),
        Some(Value::Null) => Ok(f32::NAN),
        Some(v) => v
            .as_f64()
            .map(|n| n as f32)
            .ok_or_else(|| out_of_range(field, v)),
    }
}

fn enum_field<T, R>(
    fields: &Map<String, Value>,
    field: &'static str,
    convert: impl Fn(R) -> Option<T>,
) -> Result<T, CodecError>
where
    R: TryFrom<i64> + Default + Copy + ToString,
{
    let raw: R = int(fields, field)?;
    convert(raw).ok_or_else(|| out_of_range(field, raw))
}

fn frame(f: &Map<String, Value>) -> Result<MavFrame, CodecError> {
    enum_field(f, "frame", MavFrame::from_u8)
}

fn command(f: &Map<String, Value>) -> Result<MavCmd, CodecError> {
    enum_field(f, "command", MavCmd::from_u16)
}

fn mission_type(f: &Map<String, Value>) -> Result<MavMissionType, CodecError> {
    enum_field(f, "mission_type", MavMissionType::from_u8)
}

/// Field map for a decoded message. Mission messages and HEARTBEAT use plain
/// numeric fields; everything else is the dialect's serde form.
fn message_fields(msg: &MavMessage) -> Map<String, Value> {
    let fields = match msg {
        MavMessage::MISSION_REQUEST(d) => json!({
            "target_system": d.target_system,
            "target_component": d.target_component,
            "seq": d.seq,
            "mission_type": d.mission_type as u8,
        }),
        MavMessage::MISSION_REQUEST_INT(d) => json!({
            "target_system": d.target_system,
            "target_component": d.target_component,
            "seq": d.seq,
            "mission_type": d.mission_type as u8,
        }),
        MavMessage::MISSION_ACK(d) => json!({
            "target_system": d.target_system,
            "target_component": d.target_component,
            "type": d.mavtype as u8,
            "mission_type": d.mission_type as u8,
        }),
        MavMessage::MISSION_COUNT(d) => json!({
            "target_system": d.target_system,
            "target_component": d.target_component,
            "count": d.count,
            "mission_type": d.mission_type as u8,
        }),
        MavMessage::MISSION_CURRENT(d) => json!({ "seq": d.seq }),
        MavMessage::MISSION_ITEM(d) => json!({
            "target_system": d.target_system,
            "target_component": d.target_component,
            "seq": d.seq,
            "frame": d.frame as u8,
            "command": d.command as u16,
            "current": d.current,
            "autocontinue": d.autocontinue,
            "param1": d.param1,
            "param2": d.param2,
            "param3": d.param3,
            "param4": d.param4,
            "x": d.x,
            "y": d.y,
            "z": d.z,
            "mission_type": d.mission_type as u8,
        }),
        MavMessage::MISSION_ITEM_INT(d) => json!({
            "target_system": d.target_system,
            "target_component": d.target_component,
            "seq": d.seq,
            "frame": d.frame as u8,
            "command": d.command as u16,
            "current": d.current,
            "autocontinue": d.autocontinue,
            "param1": d.param1,
            "param2": d.param2,
            "param3": d.param3,
            "param4": d.param4,
            "x": d.x,
            "y": d.y,
            "z": d.z,
            "mission_type": d.mission_type as u8,
        }),
        MavMessage::HEARTBEAT(d) => json!({
            "type": d.mavtype as u8,
            "autopilot": d.autopilot as u8,
            "base_mode": d.base_mode.bits(),
            "custom_mode": d.custom_mode,
            "system_status": d.system_status as u8,
            "mavlink_version": d.mavlink_version,
        }),
        other => serde_fields(other),
    };

    match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn serde_fields(msg: &MavMessage) -> Value {
    match serde_json::to_value(msg) {
        Ok(Value::Object(mut map)) => {
            // enum tag, not a payload field
            if map.get("type").and_then(Value::as_str) == Some(msg.message_name()) {
                map.remove("type");
            }
            Value::Object(map)
        }
        Ok(_) => Value::Null,
        Err(e) => {
            tracing::debug!("{}: no field map: {e}", msg.message_name());
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    fn request_int_frame(seq: u16) -> Vec<u8> {
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 7,
        };
        let msg = MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
            target_system: 255,
            target_component: 190,
            seq,
            ..Default::default()
        });
        let mut buf = Cursor::new(Vec::new());
        mavlink::write_v2_msg(&mut buf, header, &msg).unwrap();
        buf.into_inner()
    }

    #[test]
    fn mission_item_int_survives_the_wire() {
        let mut codec = MavlinkCodec::default();
        let fields = map(json!({
            "target_system": 1,
            "target_component": 1,
            "seq": 0,
            "frame": 3,
            "command": 16,
            "current": 1,
            "autocontinue": 1,
            "param1": 0.0,
            "param2": 2.0,
            "param3": 0.0,
            "param4": null,
            "x": 473977418,
            "y": 85455938,
            "z": 25.0,
            "mission_type": 0,
        }));

        let bytes = codec.encode("MISSION_ITEM_INT", &fields, 255, 190).unwrap();
        assert_eq!(bytes[0], MAV_STX_V2);

        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.name, "MISSION_ITEM_INT");
        assert_eq!(decoded.system_id, 255);
        assert_eq!(decoded.component_id, 190);
        assert_eq!(decoded.fields["x"], json!(473977418));
        assert_eq!(decoded.fields["y"], json!(85455938));
        assert_eq!(decoded.fields["command"], json!(16));
        // NaN has no JSON form
        assert!(decoded.fields["param4"].is_null());
    }

    #[test]
    fn sequence_counter_advances_per_frame() {
        let mut codec = MavlinkCodec::default();
        let fields = map(json!({"target_system": 1, "target_component": 1, "count": 2}));
        let a = codec.encode("MISSION_COUNT", &fields, 255, 190).unwrap();
        let b = codec.encode("MISSION_COUNT", &fields, 255, 190).unwrap();
        assert_eq!(codec.decode(&a).unwrap().sequence, 0);
        assert_eq!(codec.decode(&b).unwrap().sequence, 1);
    }

    #[test]
    fn v1_frames_are_supported() {
        let mut codec = MavlinkCodec::new(MavlinkVersion::V1);
        let fields = map(json!({"target_system": 1, "target_component": 1}));
        let bytes = codec.encode("MISSION_CLEAR_ALL", &fields, 255, 190).unwrap();
        assert_eq!(bytes[0], MAV_STX_V1);
        assert_eq!(codec.decode(&bytes).unwrap().name, "MISSION_CLEAR_ALL");
    }

    #[test]
    fn encode_errors() {
        let mut codec = MavlinkCodec::default();
        assert!(matches!(
            codec.encode("NOT_A_MESSAGE", &Map::new(), 255, 190),
            Err(CodecError::UnknownMessage(name)) if name == "NOT_A_MESSAGE"
        ));
        assert!(matches!(
            codec.encode("MISSION_COUNT", &map(json!({"count": 70000})), 255, 190),
            Err(CodecError::FieldOutOfRange { field: "count", .. })
        ));
        assert!(matches!(
            codec.encode("MISSION_ITEM", &map(json!({"frame": 200})), 255, 190),
            Err(CodecError::FieldOutOfRange { field: "frame", .. })
        ));
    }

    #[test]
    fn decodes_vehicle_requests() {
        let codec = MavlinkCodec::default();
        let decoded = codec.decode(&request_int_frame(4)).unwrap();
        assert_eq!(decoded.name, "MISSION_REQUEST_INT");
        assert_eq!(decoded.fields["seq"], json!(4));
        assert_eq!(decoded.fields["target_system"], json!(255));
        assert_eq!(decoded.sequence, 7);
    }

    #[test]
    fn garbage_is_malformed() {
        let codec = MavlinkCodec::default();
        assert!(matches!(
            codec.decode(&[0x00, 0x01, 0x02]),
            Err(CodecError::MalformedFrame(_))
        ));
        let mut frame = request_int_frame(1);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            codec.decode(&frame),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    fn stream_seqs(codec: &MavlinkCodec, stream: &[u8]) -> Vec<u64> {
        let mut reader = PeekReader::new(stream);
        let mut seqs = Vec::new();
        while let Ok(msg) = codec.read_message(&mut reader) {
            seqs.push(msg.fields["seq"].as_u64().unwrap());
        }
        seqs
    }

    #[test]
    fn stray_start_bytes_do_not_hide_later_frames() {
        let codec = MavlinkCodec::default();
        for stray in [[MAV_STX_V2, 0x30], [MAV_STX_V2, 0xFF]] {
            let mut stream = stray.to_vec();
            for seq in 0..20 {
                stream.extend_from_slice(&request_int_frame(seq));
            }
            assert_eq!(stream_seqs(&codec, &stream), (0..20).collect::<Vec<u64>>());
        }
    }

    #[test]
    fn corrupt_frame_is_skipped_in_a_stream() {
        let codec = MavlinkCodec::default();
        let mut bad = request_int_frame(0);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        let mut stream = vec![0x00, 0x42, MAV_STX_V1];
        stream.extend_from_slice(&bad);
        stream.extend_from_slice(&request_int_frame(1));
        stream.extend_from_slice(&request_int_frame(2));
        assert_eq!(stream_seqs(&codec, &stream), vec![1, 2]);
    }

    #[test]
    fn other_dialect_messages_go_by_name() {
        let mut codec = MavlinkCodec::default();
        let fields = map(json!({"target_system": 1, "custom_mode": 4, "bogus": 9}));
        let bytes = codec.encode("SET_MODE", &fields, 255, 190).unwrap();

        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.name, "SET_MODE");
        assert_eq!(decoded.fields["target_system"], json!(1));
        assert_eq!(decoded.fields["custom_mode"], json!(4));
        assert!(!decoded.fields.contains_key("type"));

        let bytes = codec
            .encode("ATTITUDE", &map(json!({"roll": 0.5, "time_boot_ms": 1200})), 1, 1)
            .unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.fields["roll"], json!(0.5));
        assert_eq!(decoded.fields["time_boot_ms"], json!(1200));

        assert!(matches!(
            codec.encode("ATTITUDE", &map(json!({"roll": "level"})), 1, 1),
            Err(CodecError::InvalidFields { name, .. }) if name == "ATTITUDE"
        ));
        assert!(is_known_message("PARAM_REQUEST_READ"));
        assert!(!is_known_message("NOT_A_MESSAGE"));
    }
}
