//! Subscription bookkeeping and inbound topic classification

use crate::error::ParcelaError;
use crate::protocol::{DeviceAnnouncement, TopicClass, TopicScheme};
use crate::transport::{MqttError, Transport};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of a subscribe request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// Already active on the current connection, nothing sent
    AlreadySubscribed,
}

/// A decoded device message
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedMessage {
    Register(DeviceAnnouncement),
    Status(DeviceAnnouncement),
}

impl RoutedMessage {
    pub fn announcement(&self) -> &DeviceAnnouncement {
        match self {
            RoutedMessage::Register(a) | RoutedMessage::Status(a) => a,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RoutedMessage::Register(_) => "register",
            RoutedMessage::Status(_) => "status",
        }
    }
}

#[derive(Debug, Default)]
struct SubscriptionSet {
    /// Patterns the service wants, in subscription order
    desired: Vec<String>,
    /// Patterns subscribed on the current connection
    active: HashSet<String>,
}

/// Owns the subscription set and classifies inbound topics
pub struct TopicRouter {
    topics: TopicScheme,
    subscriptions: Mutex<SubscriptionSet>,
}

impl TopicRouter {
    /// Router whose desired set starts with the register and status patterns
    pub fn new(topics: TopicScheme) -> Self {
        let desired = topics.startup_patterns();
        Self {
            topics,
            subscriptions: Mutex::new(SubscriptionSet {
                desired,
                active: HashSet::new(),
            }),
        }
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Subscribe once per distinct pattern for the lifetime of a connection
    ///
    /// The pattern is remembered even when the request fails, so the next
    /// `on_connected` retries it.
    pub async fn subscribe(
        &self,
        session: &dyn Transport,
        pattern: &str,
    ) -> Result<SubscribeOutcome, MqttError> {
        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.desired.iter().any(|p| p == pattern) {
            subscriptions.desired.push(pattern.to_string());
        }
        if subscriptions.active.contains(pattern) {
            debug!(pattern = %pattern, "Already subscribed");
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        session.subscribe(pattern).await?;
        subscriptions.active.insert(pattern.to_string());
        info!(pattern = %pattern, "Subscribed");
        Ok(SubscribeOutcome::Subscribed)
    }

    /// Reset the active set and subscribe every desired pattern again
    ///
    /// Returns the number of patterns subscribed.
    pub async fn on_connected(&self, session: &dyn Transport) -> usize {
        let desired = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.active.clear();
            subscriptions.desired.clone()
        };

        let mut subscribed = 0;
        for pattern in &desired {
            match self.subscribe(session, pattern).await {
                Ok(_) => subscribed += 1,
                Err(e) => warn!(pattern = %pattern, error = %e, "Resubscribe failed"),
            }
        }
        subscribed
    }

    pub async fn desired_patterns(&self) -> Vec<String> {
        self.subscriptions.lock().await.desired.clone()
    }

    pub async fn is_active(&self, pattern: &str) -> bool {
        self.subscriptions.lock().await.active.contains(pattern)
    }

    /// Decode a message on a register or status topic
    ///
    /// `Ok(None)` for control echoes and topics outside the scheme. The
    /// payload's `deviceId` is authoritative; a different topic segment is
    /// only logged.
    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<Option<RoutedMessage>, ParcelaError> {
        let (topic_device, register) = match self.topics.classify(topic) {
            TopicClass::Register(id) => (id, true),
            TopicClass::Status(id) => (id, false),
            TopicClass::ControlEcho(id) => {
                debug!(topic = %topic, device_id = %id, "Ignoring control echo");
                return Ok(None);
            }
            TopicClass::Unknown => {
                debug!(topic = %topic, "Ignoring message on unknown topic");
                return Ok(None);
            }
        };

        let announcement =
            DeviceAnnouncement::decode(payload).map_err(|source| ParcelaError::MessageDecode {
                topic: topic.to_string(),
                source,
            })?;

        if announcement.device_id != topic_device {
            debug!(
                topic = %topic,
                topic_device = %topic_device,
                device_id = %announcement.device_id,
                "Payload device id differs from topic"
            );
        }

        Ok(Some(if register {
            RoutedMessage::Register(announcement)
        } else {
            RoutedMessage::Status(announcement)
        }))
    }
}
