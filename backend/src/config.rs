use crate::mission::EngineConfig;
use mavlink::MavlinkVersion;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 14550;
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_DB_PATH: &str = "./data/groundstation.db";

/// MAV_TYPE_GCS-style identity we put in every outgoing header.
pub const DEFAULT_GCS_SYSTEM_ID: u8 = 255;
pub const DEFAULT_GCS_COMPONENT_ID: u8 = 190;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkConfig {
    /// Bind `port` locally; talk to `host:port` until a vehicle shows up.
    Udp { host: String, port: u16 },
    Tcp { host: String, port: u16 },
    Serial { path: String, baud: u32 },
}

impl LinkConfig {
    pub fn describe(&self) -> String {
        match self {
            LinkConfig::Udp { host, port } => format!("udp:{host}:{port}"),
            LinkConfig::Tcp { host, port } => format!("tcp:{host}:{port}"),
            LinkConfig::Serial { path, baud } => format!("serial:{path}@{baud}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GcsConfig {
    pub link: LinkConfig,
    pub mavlink_version: MavlinkVersion,
    pub system_id: u8,
    pub component_id: u8,
    pub target_system: u8,
    pub target_component: u8,
    pub mission_timeout: Duration,
    pub accept_grace: Duration,
    pub http_addr: String,
    pub db_path: String,
}

impl GcsConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let host = lookup("GCS_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = lookup("GCS_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let link = match lookup("GCS_LINK").as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("tcp") => LinkConfig::Tcp { host, port },
            Some("serial") => LinkConfig::Serial {
                path: lookup("GCS_SERIAL_PORT").unwrap_or_else(|| "/dev/ttyUSB0".to_string()),
                baud: lookup("GCS_BAUD")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(DEFAULT_BAUDRATE),
            },
            Some("udp") | None => LinkConfig::Udp { host, port },
            Some(other) => {
                tracing::warn!("Unknown GCS_LINK {other:?}, falling back to udp");
                LinkConfig::Udp { host, port }
            }
        };

        let mavlink_version = match lookup("GCS_MAVLINK_VERSION").as_deref() {
            Some("1") | Some("1.0") => MavlinkVersion::V1,
            _ => MavlinkVersion::V2,
        };

        let id = |key: &str, default: u8| {
            lookup(key)
                .and_then(|v| v.parse::<u8>().ok())
                .unwrap_or(default)
        };

        Self {
            link,
            mavlink_version,
            system_id: id("GCS_SYSTEM_ID", DEFAULT_GCS_SYSTEM_ID),
            component_id: id("GCS_COMPONENT_ID", DEFAULT_GCS_COMPONENT_ID),
            target_system: id("GCS_TARGET_SYSTEM", 1),
            target_component: id("GCS_TARGET_COMPONENT", 1),
            mission_timeout: parsed("GCS_MISSION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_millis(10_000)),
            accept_grace: parsed("GCS_ACCEPT_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_millis(3_000)),
            http_addr: lookup("GCS_HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            db_path: lookup("GCS_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            target_system: self.target_system,
            target_component: self.target_component,
            gcs_system_id: self.system_id,
            response_timeout: self.mission_timeout,
            accept_grace: self.accept_grace,
        }
    }
}
