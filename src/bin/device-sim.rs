//! Device simulator - behaves like a Parcela locker board
//!
//! Registers as online, leaves a retained `offline` status as its last-will,
//! listens on its control topic and reacts to commands. Kill it with SIGKILL
//! to watch the broker publish the last-will; Ctrl-C announces offline first.

use clap::Parser;
use parcela::observability::init_default_logging;
use parcela::protocol::{ControlCommand, DeviceAnnouncement, TopicScheme};
use parcela::transport::{
    ConnectionEvent, InboundMessage, MqttSessionFactory, SessionFactory, SessionHooks,
    SessionOptions, Transport, WillMessage, EVENT_CHANNEL_CAPACITY, INBOUND_CHANNEL_CAPACITY,
};
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Simulated Parcela locker device
#[derive(Parser)]
#[command(name = "device-sim")]
#[command(about = "Simulate a Parcela locker device over MQTT")]
#[command(version)]
struct Args {
    /// Device identifier used in every topic
    #[arg(long, default_value = "SIM-001")]
    device_id: String,

    /// MQTT broker URL
    #[arg(long, env = "PARCELA_MQTT_BROKER", default_value = "mqtt://localhost:1883")]
    broker_url: String,

    /// Topic namespace
    #[arg(long, default_value = "parcela")]
    namespace: String,

    /// MQTT username (optional)
    #[arg(long, env = "PARCELA_MQTT_USERNAME")]
    username: Option<String>,

    /// MQTT password (optional)
    #[arg(long, env = "PARCELA_MQTT_PASSWORD")]
    password: Option<String>,

    /// Keep-alive in seconds; the broker fires the last-will after 1.5x this
    #[arg(long, default_value_t = 5)]
    keep_alive: u64,
}

/// What the simulated board does in response to a command
#[derive(Debug, PartialEq, Eq)]
enum Reaction {
    Continue,
    Exit,
}

struct SimulatedDevice {
    device_id: String,
    topics: TopicScheme,
    alarm_on: bool,
    confirmed: bool,
}

impl SimulatedDevice {
    fn handle(&mut self, command: ControlCommand) -> Reaction {
        match command {
            ControlCommand::AlarmOn => {
                self.alarm_on = true;
                warn!(device_id = %self.device_id, "ALARM SOUNDING");
            }
            ControlCommand::AlarmOff => {
                if self.alarm_on {
                    info!(device_id = %self.device_id, "Alarm silenced");
                }
                self.alarm_on = false;
            }
            ControlCommand::ConfirmConnected => {
                self.confirmed = true;
                info!(device_id = %self.device_id, "Bound to a parcel record");
            }
            ControlCommand::Disconnect => {
                info!(device_id = %self.device_id, "Released from parcel record, powering down");
                return Reaction::Exit;
            }
        }
        Reaction::Continue
    }

    async fn announce(&self, session: &dyn Transport, status: &str) {
        let announcement = DeviceAnnouncement::new(&self.device_id, status).encode();
        for topic in [
            self.topics.register_topic(&self.device_id),
            self.topics.status_topic(&self.device_id),
        ] {
            if let Err(e) = session.publish(&topic, announcement.clone(), true).await {
                error!(topic = %topic, error = %e, "Failed to announce");
            }
        }
    }

    async fn on_connected(&self, session: &dyn Transport) {
        let control = self.topics.control_topic(&self.device_id);
        if let Err(e) = session.subscribe(&control).await {
            error!(topic = %control, error = %e, "Failed to subscribe to control topic");
        }
        self.announce(session, "online").await;
        info!(device_id = %self.device_id, control = %control, "Device online");
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_default_logging();

    if let Err(e) = run(args).await {
        error!("Device simulator failed: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let topics = TopicScheme::new(&args.namespace)?;
    let mut device = SimulatedDevice {
        device_id: args.device_id.clone(),
        topics: topics.clone(),
        alarm_on: false,
        confirmed: false,
    };

    let mut options = SessionOptions::new(&args.broker_url, format!("device-{}", args.device_id))
        .with_last_will(WillMessage {
            topic: topics.status_topic(&args.device_id),
            payload: DeviceAnnouncement::new(&args.device_id, "offline").encode(),
            retain: true,
        });
    options.keep_alive = Duration::from_secs(args.keep_alive);
    if let (Some(username), Some(password)) = (args.username, args.password) {
        options.credentials = Some((username, password));
    }

    let (inbound_tx, mut inbound) = mpsc::channel::<InboundMessage>(INBOUND_CHANNEL_CAPACITY);
    let (events_tx, mut events) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let session = MqttSessionFactory
        .open(
            &options,
            SessionHooks {
                inbound: inbound_tx,
                events: events_tx,
            },
        )
        .await?;

    info!(broker = %args.broker_url, device_id = %args.device_id, "Device simulator started");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ConnectionEvent::Connected) => device.on_connected(session.as_ref()).await,
                Ok(other) => debug!(event = other.as_str(), "Connection event"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            message = inbound.recv() => {
                let Some(message) = message else { break };
                match ControlCommand::parse(&message.payload) {
                    Some(command) => {
                        info!(command = command.as_str(), "Command received");
                        if device.handle(command) == Reaction::Exit {
                            device.announce(session.as_ref(), "offline").await;
                            break;
                        }
                    }
                    None => warn!(
                        topic = %message.topic,
                        payload = %String::from_utf8_lossy(&message.payload),
                        "Ignoring unknown command"
                    ),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, announcing offline");
                device.announce(session.as_ref(), "offline").await;
                break;
            }
        }
    }

    // Give queued publishes a moment to reach the broker before closing
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.close().await;
    info!(confirmed = device.confirmed, "Device simulator stopped");
    Ok(())
}
