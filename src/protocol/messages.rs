//! Device payloads and control commands
//!
//! Devices publish small JSON objects (`{"deviceId": "...", "status": "..."}`)
//! on their register and status topics. The core answers with plain-string
//! commands on the control topic.

use super::topics::validate_device_id;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Announcement published by a device on its register or status topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAnnouncement {
    pub device_id: String,
    pub status: String,
}

impl DeviceAnnouncement {
    pub fn new(device_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: status.into(),
        }
    }

    /// Decode a raw broker payload
    ///
    /// The payload must be a JSON object with non-empty string `deviceId` and
    /// `status` fields. Extra fields are ignored.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }

        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let field = |name: &'static str| {
            object
                .get(name)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or(DecodeError::MissingField(name))
        };

        let device_id = field("deviceId")?;
        let status = field("status")?;

        validate_device_id(&device_id).map_err(|_| DecodeError::InvalidDeviceId(device_id.clone()))?;

        Ok(Self { device_id, status })
    }

    pub fn encode(&self) -> Vec<u8> {
        // Two plain strings always serialize
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn device_status(&self) -> DeviceStatus {
        DeviceStatus::parse(&self.status)
    }
}

/// Why an inbound payload was dropped
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing or empty field '{0}'")]
    MissingField(&'static str),
    #[error("device ID '{0}' cannot be used as a topic level")]
    InvalidDeviceId(String),
}

/// Last known liveness of a device
///
/// Anything other than `online`/`offline` is kept verbatim so broker-reported
/// states survive a round trip through the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceStatus {
    Online,
    Offline,
    Other(String),
}

impl DeviceStatus {
    /// Parse a broker-reported status, case-insensitive for the known states
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("online") {
            DeviceStatus::Online
        } else if raw.eq_ignore_ascii_case("offline") {
            DeviceStatus::Offline
        } else {
            DeviceStatus::Other(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Other(raw) => raw,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DeviceStatus::Online)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, DeviceStatus::Offline)
    }
}

impl From<String> for DeviceStatus {
    fn from(raw: String) -> Self {
        DeviceStatus::parse(&raw)
    }
}

impl From<DeviceStatus> for String {
    fn from(status: DeviceStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain-string commands published on a device's control topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    AlarmOn,
    AlarmOff,
    ConfirmConnected,
    Disconnect,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::AlarmOn => "ALARM_ON",
            ControlCommand::AlarmOff => "ALARM_OFF",
            ControlCommand::ConfirmConnected => "CONFIRM_CONNECTED",
            ControlCommand::Disconnect => "DISCONNECT",
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        self.as_str().as_bytes().to_vec()
    }

    /// Parse a control payload as received by a device
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match std::str::from_utf8(payload).ok()?.trim() {
            "ALARM_ON" => Some(ControlCommand::AlarmOn),
            "ALARM_OFF" => Some(ControlCommand::AlarmOff),
            "CONFIRM_CONNECTED" => Some(ControlCommand::ConfirmConnected),
            "DISCONNECT" => Some(ControlCommand::Disconnect),
            _ => None,
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing alarm actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmAction {
    On,
    Off,
    Reset,
}

impl AlarmAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmAction::On => "on",
            AlarmAction::Off => "off",
            AlarmAction::Reset => "reset",
        }
    }

    /// Wire command for this action
    ///
    /// `Reset` deliberately maps to `ALARM_OFF`: deployed firmware has no
    /// separate reset command.
    pub fn command(&self) -> ControlCommand {
        match self {
            AlarmAction::On => ControlCommand::AlarmOn,
            AlarmAction::Off | AlarmAction::Reset => ControlCommand::AlarmOff,
        }
    }
}

impl FromStr for AlarmAction {
    type Err = InvalidAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(AlarmAction::On),
            "off" => Ok(AlarmAction::Off),
            "reset" => Ok(AlarmAction::Reset),
            _ => Err(InvalidAction(s.to_string())),
        }
    }
}

impl fmt::Display for AlarmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid alarm action '{0}', expected on, off or reset")]
pub struct InvalidAction(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_valid_announcement() {
        let parsed = DeviceAnnouncement::decode(br#"{"deviceId":"D1","status":"online"}"#).unwrap();
        assert_eq!(parsed, DeviceAnnouncement::new("D1", "online"));
        assert!(parsed.device_status().is_online());
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let parsed =
            DeviceAnnouncement::decode(br#"{"deviceId":"D1","status":"offline","rssi":-70}"#)
                .unwrap();
        assert_eq!(parsed.device_id, "D1");
        assert!(parsed.device_status().is_offline());
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert_eq!(DeviceAnnouncement::decode(b""), Err(DecodeError::Empty));
        assert_eq!(DeviceAnnouncement::decode(b"  \n"), Err(DecodeError::Empty));
        assert!(matches!(
            DeviceAnnouncement::decode(b"{not json"),
            Err(DecodeError::InvalidJson(_))
        ));
        assert_eq!(
            DeviceAnnouncement::decode(b"[1,2]"),
            Err(DecodeError::NotAnObject)
        );
        assert_eq!(
            DeviceAnnouncement::decode(br#"{"status":"online"}"#),
            Err(DecodeError::MissingField("deviceId"))
        );
        assert_eq!(
            DeviceAnnouncement::decode(br#"{"deviceId":"D1"}"#),
            Err(DecodeError::MissingField("status"))
        );
        assert_eq!(
            DeviceAnnouncement::decode(br#"{"deviceId":"","status":"online"}"#),
            Err(DecodeError::MissingField("deviceId"))
        );
        assert_eq!(
            DeviceAnnouncement::decode(br#"{"deviceId":42,"status":"online"}"#),
            Err(DecodeError::MissingField("deviceId"))
        );
        assert_eq!(
            DeviceAnnouncement::decode(br#"{"deviceId":"a/b","status":"online"}"#),
            Err(DecodeError::InvalidDeviceId("a/b".to_string()))
        );
    }

    #[test]
    fn test_encode_uses_camel_case() {
        let json = String::from_utf8(DeviceAnnouncement::new("D1", "online").encode()).unwrap();
        assert!(json.contains("\"deviceId\":\"D1\""));
        assert!(json.contains("\"status\":\"online\""));
    }

    #[test]
    fn test_device_status_parsing() {
        assert_eq!(DeviceStatus::parse("ONLINE"), DeviceStatus::Online);
        assert_eq!(DeviceStatus::parse("Offline"), DeviceStatus::Offline);
        assert_eq!(
            DeviceStatus::parse("rebooting"),
            DeviceStatus::Other("rebooting".to_string())
        );
        assert_eq!(DeviceStatus::Other("sleep".to_string()).to_string(), "sleep");
    }

    #[test]
    fn test_device_status_serde_is_plain_string() {
        let json = serde_json::to_string(&DeviceStatus::Online).unwrap();
        assert_eq!(json, "\"online\"");
        let parsed: DeviceStatus = serde_json::from_str("\"OFFLINE\"").unwrap();
        assert_eq!(parsed, DeviceStatus::Offline);
    }

    #[test]
    fn test_alarm_action_mapping() {
        assert_eq!(AlarmAction::On.command(), ControlCommand::AlarmOn);
        assert_eq!(AlarmAction::Off.command(), ControlCommand::AlarmOff);
        assert_eq!(AlarmAction::Reset.command(), ControlCommand::AlarmOff);
        assert_eq!(AlarmAction::Reset.command().as_str(), "ALARM_OFF");
    }

    #[test]
    fn test_alarm_action_from_str() {
        assert_eq!("on".parse::<AlarmAction>(), Ok(AlarmAction::On));
        assert_eq!("OFF".parse::<AlarmAction>(), Ok(AlarmAction::Off));
        assert_eq!(" reset ".parse::<AlarmAction>(), Ok(AlarmAction::Reset));
        assert_eq!(
            "toggle".parse::<AlarmAction>(),
            Err(InvalidAction("toggle".to_string()))
        );
    }

    #[test]
    fn test_control_command_parse() {
        assert_eq!(ControlCommand::parse(b"ALARM_ON"), Some(ControlCommand::AlarmOn));
        assert_eq!(
            ControlCommand::parse(b"DISCONNECT\n"),
            Some(ControlCommand::Disconnect)
        );
        assert_eq!(ControlCommand::parse(b"alarm_on"), None);
        assert_eq!(ControlCommand::parse(&[0xff, 0xfe]), None);
    }
}
