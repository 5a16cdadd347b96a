//! MISSION_ACK result vocabulary (MAV_MISSION_RESULT).

/// Outcome code carried by MISSION_ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionAck {
    Accepted,
    Error,
    UnsupportedFrame,
    Unsupported,
    NoSpace,
    Invalid,
    InvalidParam1,
    InvalidParam2,
    InvalidParam3,
    InvalidParam4,
    InvalidParam5X,
    InvalidParam6Y,
    InvalidParam7Z,
    InvalidSequence,
    Cancelled,
    /// Anything outside 0..=14. Treated as a rejection.
    Unknown(i64),
}

const NAMED: [(MissionAck, &str); 15] = [
    (MissionAck::Accepted, "ACCEPTED"),
    (MissionAck::Error, "ERROR"),
    (MissionAck::UnsupportedFrame, "UNSUPPORTED_FRAME"),
    (MissionAck::Unsupported, "UNSUPPORTED"),
    (MissionAck::NoSpace, "NO_SPACE"),
    (MissionAck::Invalid, "INVALID"),
    (MissionAck::InvalidParam1, "INVALID_PARAM1"),
    (MissionAck::InvalidParam2, "INVALID_PARAM2"),
    (MissionAck::InvalidParam3, "INVALID_PARAM3"),
    (MissionAck::InvalidParam4, "INVALID_PARAM4"),
    (MissionAck::InvalidParam5X, "INVALID_PARAM5_X"),
    (MissionAck::InvalidParam6Y, "INVALID_PARAM6_Y"),
    (MissionAck::InvalidParam7Z, "INVALID_PARAM7_Z"),
    (MissionAck::InvalidSequence, "INVALID_SEQUENCE"),
    (MissionAck::Cancelled, "CANCELLED"),
];

impl MissionAck {
    pub fn from_code(code: i64) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|idx| NAMED.get(idx))
            .map(|(ack, _)| *ack)
            .unwrap_or(MissionAck::Unknown(code))
    }

    pub fn code(&self) -> i64 {
        match self {
            MissionAck::Unknown(code) => *code,
            known => NAMED
                .iter()
                .position(|(ack, _)| ack == known)
                .map(|idx| idx as i64)
                .unwrap_or_default(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            MissionAck::Unknown(code) => format!("UNKNOWN({code})"),
            known => NAMED
                .iter()
                .find(|(ack, _)| ack == known)
                .map(|(_, name)| (*name).to_string())
                .unwrap_or_default(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        *self == MissionAck::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_fixed_names() {
        assert_eq!(MissionAck::from_code(0), MissionAck::Accepted);
        assert_eq!(MissionAck::from_code(4).name(), "NO_SPACE");
        assert_eq!(MissionAck::from_code(10).name(), "INVALID_PARAM5_X");
        assert_eq!(MissionAck::from_code(13), MissionAck::InvalidSequence);
        assert_eq!(MissionAck::from_code(14).name(), "CANCELLED");
    }

    #[test]
    fn only_zero_is_success() {
        assert!(MissionAck::from_code(0).is_accepted());
        assert!((1..=14).all(|c| !MissionAck::from_code(c).is_accepted()));
    }

    #[test]
    fn out_of_table_codes_are_unknown() {
        let ack = MissionAck::from_code(15);
        assert_eq!(ack, MissionAck::Unknown(15));
        assert_eq!(ack.name(), "UNKNOWN(15)");
        assert_eq!(MissionAck::from_code(-1).code(), -1);
        assert_eq!(MissionAck::NoSpace.code(), 4);
    }
}
