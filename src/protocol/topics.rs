//! Topic layout and matching for the parcela device protocol
//!
//! Every device owns three topics under a shared namespace:
//!
//! - `<ns>/<device_id>/register` - device announces presence
//! - `<ns>/<device_id>/status` - liveness notices, usually the device's last will
//! - `<ns>/<device_id>/control` - commands from the core to the device
//!
//! Matching follows MQTT filter semantics: `+` binds exactly one level and `#`
//! matches the remaining levels. Classification never falls back to substring
//! matching.

use thiserror::Error;

/// Namespace used by deployed devices
pub const DEFAULT_NAMESPACE: &str = "parcela";

const REGISTER_SUFFIX: &str = "register";
const STATUS_SUFFIX: &str = "status";
const CONTROL_SUFFIX: &str = "control";

/// Result of classifying an inbound topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicClass {
    /// `<ns>/<id>/register`
    Register(String),
    /// `<ns>/<id>/status`
    Status(String),
    /// `<ns>/<id>/control`, our own commands echoed back by the broker
    ControlEcho(String),
    /// Anything outside the device topic layout
    Unknown,
}

/// Topic construction and classification for one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    namespace: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl TopicScheme {
    /// Create a scheme rooted at `namespace` (a single topic level)
    pub fn new(namespace: &str) -> Result<Self, ValidationError> {
        validate_topic_level(namespace).map_err(|_| {
            ValidationError::InvalidNamespace(namespace.to_string())
        })?;
        Ok(Self {
            namespace: namespace.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn register_topic(&self, device_id: &str) -> String {
        format!("{}/{device_id}/{REGISTER_SUFFIX}", self.namespace)
    }

    pub fn status_topic(&self, device_id: &str) -> String {
        format!("{}/{device_id}/{STATUS_SUFFIX}", self.namespace)
    }

    pub fn control_topic(&self, device_id: &str) -> String {
        format!("{}/{device_id}/{CONTROL_SUFFIX}", self.namespace)
    }

    /// Wildcard filter for every device's registration topic
    pub fn register_pattern(&self) -> String {
        format!("{}/+/{REGISTER_SUFFIX}", self.namespace)
    }

    /// Wildcard filter for every device's status topic
    pub fn status_pattern(&self) -> String {
        format!("{}/+/{STATUS_SUFFIX}", self.namespace)
    }

    /// Wildcard filter for every device's control topic
    pub fn control_pattern(&self) -> String {
        format!("{}/+/{CONTROL_SUFFIX}", self.namespace)
    }

    /// Patterns the router subscribes to on every connect
    pub fn startup_patterns(&self) -> Vec<String> {
        vec![self.register_pattern(), self.status_pattern()]
    }

    /// Classify an inbound topic and extract the device identifier bound by `+`
    pub fn classify(&self, topic: &str) -> TopicClass {
        let device_id = match topic.split('/').nth(1) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return TopicClass::Unknown,
        };

        if topic_matches(&self.register_pattern(), topic) {
            TopicClass::Register(device_id)
        } else if topic_matches(&self.status_pattern(), topic) {
            TopicClass::Status(device_id)
        } else if topic_matches(&self.control_pattern(), topic) {
            TopicClass::ControlEcho(device_id)
        } else {
            TopicClass::Unknown
        }
    }
}

/// MQTT topic filter matching
///
/// `+` matches exactly one level (which may be empty), `#` matches the parent
/// level and everything below it. Wildcards never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a device identifier so it can be embedded as one topic level
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    validate_topic_level(device_id)
}

fn validate_topic_level(level: &str) -> Result<(), ValidationError> {
    if level.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    match level.chars().find(|c| matches!(c, '/' | '+' | '#' | '\0')) {
        Some(ch) => Err(ValidationError::InvalidDeviceIdChar(ch)),
        None => Ok(()),
    }
}

/// Validation errors for topic construction
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains reserved topic character: '{0}'")]
    InvalidDeviceIdChar(char),
    #[error("Invalid topic namespace: '{0}'")]
    InvalidNamespace(String),
}
