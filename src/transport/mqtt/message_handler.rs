//! Pure routing of rumqttc events and forwarding of inbound publishes

use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{ConnectionError, Event, StateError};
use rumqttc::Outgoing;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                }),
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("broker sent {disconnect:?}"))
                }
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                EventRoute::PublishWritten { packet_id: *pkid }
            }
            Event::Outgoing(Outgoing::AwaitAck(pkid)) => {
                EventRoute::PublishDeferred { packet_id: *pkid }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Reason code when a negative PUBACK ended the connection
    ///
    /// rumqttc surfaces a refused publish as a state error instead of an
    /// incoming PUBACK.
    pub fn publish_rejection(error: &ConnectionError) -> Option<String> {
        match error {
            ConnectionError::MqttState(StateError::PubAckFail { reason }) => {
                Some(format!("{reason:?}"))
            }
            _ => None,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Publish received on a subscribed topic
    MessageReceived(InboundMessage),
    /// Broker sent DISCONNECT
    Disconnected(String),
    SubscriptionConfirmed { packet_id: u16 },
    /// QoS 1 publish written to the socket
    PublishWritten { packet_id: u16 },
    /// Next publish held back until `packet_id` is acknowledged
    PublishDeferred { packet_id: u16 },
    PublishAcknowledged { packet_id: u16 },
    /// PingResp, PubRec and the like
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Hands inbound publishes to the single processing loop
pub struct MessageForwarder {
    sender: mpsc::Sender<InboundMessage>,
}

impl MessageForwarder {
    pub fn new(sender: mpsc::Sender<InboundMessage>) -> Self {
        Self { sender }
    }

    /// Forward in arrival order; waits when the processing loop is behind
    ///
    /// Returns false once the processing loop has gone away.
    pub async fn forward(&self, message: InboundMessage) -> bool {
        debug!(
            topic = %message.topic,
            retain = message.retain,
            bytes = message.payload.len(),
            "Forwarding inbound message"
        );
        if self.sender.send(message).await.is_err() {
            warn!("Inbound channel closed, dropping message");
            return false;
        }
        true
    }
}
