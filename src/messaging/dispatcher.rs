//! Outbound command path: record to device to control topic

use super::connection_manager::ConnectionManager;
use super::dedup::DedupWindow;
use super::retry::{execute_with_retry, RetryPolicy, Sleeper, TokioSleeper};
use crate::config::DispatchSection;
use crate::error::{ParcelaError, ParcelaResult};
use crate::observability::metrics;
use crate::protocol::{AlarmAction, ControlCommand, TopicScheme};
use crate::store::{DeviceStore, Record};
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// A command the session accepted for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReceipt {
    pub topic: String,
    pub payload: String,
    pub attempts: u32,
}

/// Result of one fail-safe send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailsafeSend {
    Sent,
    Suppressed,
    Failed,
}

/// Tally of a whole fail-safe schedule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailsafeReport {
    pub sent: u32,
    pub suppressed: u32,
    pub failed: u32,
}

pub struct CommandDispatcher {
    connection: Arc<ConnectionManager>,
    store: Arc<dyn DeviceStore>,
    topics: TopicScheme,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    dedup: DedupWindow,
    reconnect_wait: Duration,
    require_online: bool,
    failsafe_offsets: Vec<Duration>,
}

impl CommandDispatcher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        store: Arc<dyn DeviceStore>,
        topics: TopicScheme,
        dispatch: &DispatchSection,
    ) -> Self {
        Self {
            connection,
            store,
            topics,
            policy: RetryPolicy::from_dispatch(dispatch),
            sleeper: Arc::new(TokioSleeper),
            dedup: DedupWindow::new(dispatch.dedup_window()),
            reconnect_wait: dispatch.reconnect_wait(),
            require_online: dispatch.require_online,
            failsafe_offsets: dispatch.failsafe_offsets(),
        }
    }

    /// Replace the sleeper used between delivery attempts
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send an operator alarm action to the device bound to `record_id`
    ///
    /// Fails without publishing when the record is unknown, has no device, or
    /// (with the online policy enforced) the device is not reported online.
    pub async fn send_alarm_command(
        &self,
        record_id: &str,
        action: AlarmAction,
    ) -> ParcelaResult<CommandReceipt> {
        let record = self.find_record(record_id).await?;
        let device_id = bound_device(&record)?;

        if self.require_online {
            match self.store.find_device(device_id).await? {
                Some(device) if device.status.is_online() => {}
                Some(device) => {
                    return Err(ParcelaError::device_offline(device_id, device.status.as_str()))
                }
                None => return Err(ParcelaError::device_offline(device_id, "unknown")),
            }
        }

        debug!(
            record_id = %record_id,
            device_id = %device_id,
            action = %action,
            "Sending alarm action"
        );
        self.deliver(device_id, action.command()).await
    }

    /// Tell a freshly bound device that the binding succeeded
    pub async fn confirm_device_binding(
        &self,
        record_id: &str,
        device_id: &str,
    ) -> ParcelaResult<CommandReceipt> {
        debug!(record_id = %record_id, device_id = %device_id, "Confirming device binding");
        self.deliver(device_id, ControlCommand::ConfirmConnected)
            .await
    }

    /// Tell the device bound to `record_id` that it is being released
    pub async fn send_disconnect(&self, record_id: &str) -> ParcelaResult<CommandReceipt> {
        let record = self.find_record(record_id).await?;
        let device_id = bound_device(&record)?;
        self.deliver(device_id, ControlCommand::Disconnect).await
    }

    /// Publish `command` to the device's control topic with bounded retry
    ///
    /// Each attempt first makes sure a connected session exists, waiting at
    /// most `reconnect_wait` for it. A publish the broker rejects is not
    /// repeated.
    pub async fn deliver(
        &self,
        device_id: &str,
        command: ControlCommand,
    ) -> ParcelaResult<CommandReceipt> {
        ParcelaError::check_device_id(device_id)?;
        let topic = self.topics.control_topic(device_id);
        let span = crate::command_span!(
            command = command.as_str(),
            device_id = %device_id,
            topic = %topic
        );
        let started = Instant::now();

        let result = execute_with_retry(
            &self.policy,
            self.sleeper.as_ref(),
            command.as_str(),
            ParcelaError::is_transient,
            |attempt| {
                let topic = topic.clone();
                async move {
                    debug!(topic = %topic, attempt, "Publishing command");
                    let session = self.connected_session().await?;
                    session
                        .publish(&topic, command.payload(), false)
                        .await
                        .map_err(ParcelaError::from)
                }
            },
        )
        .instrument(span)
        .await;

        match result {
            Ok(retried) => {
                metrics().command_published(command.as_str(), retried.attempts, started.elapsed());
                info!(
                    device_id = %device_id,
                    topic = %topic,
                    command = command.as_str(),
                    attempts = retried.attempts,
                    "Command accepted for delivery"
                );
                Ok(CommandReceipt {
                    topic,
                    payload: command.as_str().to_string(),
                    attempts: retried.attempts,
                })
            }
            Err(failure) => {
                metrics().command_failed(failure.attempts);
                warn!(
                    device_id = %device_id,
                    topic = %topic,
                    command = command.as_str(),
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "Command delivery failed"
                );
                Err(ParcelaError::CommandDeliveryFailed {
                    topic,
                    attempts: failure.attempts,
                    source: Box::new(failure.last_error),
                })
            }
        }
    }

    /// Send one fail-safe `ALARM_OFF` unless an identical one went out recently
    pub async fn send_failsafe_off(&self, device_id: &str) -> FailsafeSend {
        let command = ControlCommand::AlarmOff;
        let topic = self.topics.control_topic(device_id);

        if !self.dedup.try_acquire(&topic, &command.payload()) {
            metrics().failsafe_suppressed();
            debug!(device_id = %device_id, topic = %topic, "Fail-safe send suppressed");
            return FailsafeSend::Suppressed;
        }

        match self.deliver(device_id, command).await {
            Ok(_) => {
                metrics().failsafe_sent();
                FailsafeSend::Sent
            }
            Err(e) => {
                // A failed send must not suppress the next attempt
                self.dedup.release(&topic, &command.payload());
                warn!(device_id = %device_id, error = %e, "Fail-safe ALARM_OFF not delivered");
                FailsafeSend::Failed
            }
        }
    }

    /// Send `ALARM_OFF` at every configured offset on a separate task
    pub fn schedule_failsafe_off(self: &Arc<Self>, device_id: &str) -> JoinHandle<FailsafeReport> {
        let dispatcher = Arc::clone(self);
        let device_id = device_id.to_string();
        let offsets = self.failsafe_offsets.clone();
        metrics().failsafe_scheduled();
        info!(device_id = %device_id, sends = offsets.len(), "Scheduling fail-safe ALARM_OFF");

        tokio::spawn(async move {
            let start = Instant::now();
            let mut report = FailsafeReport::default();
            for offset in offsets {
                tokio::time::sleep_until(start + offset).await;
                match dispatcher.send_failsafe_off(&device_id).await {
                    FailsafeSend::Sent => report.sent += 1,
                    FailsafeSend::Suppressed => report.suppressed += 1,
                    FailsafeSend::Failed => report.failed += 1,
                }
            }
            report
        })
    }

    async fn connected_session(&self) -> ParcelaResult<Arc<dyn Transport>> {
        self.connection.connect_and_wait(self.reconnect_wait).await
    }

    async fn find_record(&self, record_id: &str) -> ParcelaResult<Record> {
        self.store
            .find_record(record_id)
            .await?
            .ok_or_else(|| ParcelaError::record_not_found(record_id))
    }
}

fn bound_device(record: &Record) -> ParcelaResult<&str> {
    record
        .bound_device()
        .ok_or_else(|| ParcelaError::no_device_bound(&record.record_id))
}
