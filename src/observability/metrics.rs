//! Thread-safe metrics collection
//!
//! Atomic counters for the inbound path, command delivery, fail-safe sends,
//! liveness sweeps and broker connectivity. A process-wide collector is
//! available through [`metrics`]; components that need isolation in tests
//! can own a [`MetricsCollector`] directly.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Bound on retained delivery time samples
const MAX_DELIVERY_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Inbound path
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    devices_upserted: AtomicU64,
    status_updates: AtomicU64,

    // Outbound commands
    commands_published: AtomicU64,
    commands_failed: AtomicU64,
    command_retries: AtomicU64,
    commands_by_kind: Mutex<HashMap<String, u64>>,
    delivery_times: Mutex<Vec<u64>>,

    // Fail-safe and sweep
    failsafe_scheduled: AtomicU64,
    failsafe_sent: AtomicU64,
    failsafe_suppressed: AtomicU64,
    sweeps_run: AtomicU64,
    sweep_clears: AtomicU64,
    sweep_failures: AtomicU64,

    // Broker connectivity
    mqtt_connected: AtomicBool,
    connections_established: AtomicU64,
    disconnects: AtomicU64,
    connection_errors: AtomicU64,
    reconnect_attempts: AtomicU64,
    connection_start_time: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            devices_upserted: AtomicU64::new(0),
            status_updates: AtomicU64::new(0),
            commands_published: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            command_retries: AtomicU64::new(0),
            commands_by_kind: Mutex::new(HashMap::new()),
            delivery_times: Mutex::new(Vec::new()),
            failsafe_scheduled: AtomicU64::new(0),
            failsafe_sent: AtomicU64::new(0),
            failsafe_suppressed: AtomicU64::new(0),
            sweeps_run: AtomicU64::new(0),
            sweep_clears: AtomicU64::new(0),
            sweep_failures: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connections_established: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Inbound path
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device_upserted(&self) {
        self.devices_upserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status_updated(&self) {
        self.status_updates.fetch_add(1, Ordering::Relaxed);
    }

    // Outbound commands
    pub fn command_published(&self, kind: &str, attempts: u32, elapsed: Duration) {
        self.commands_published.fetch_add(1, Ordering::Relaxed);
        self.command_retries
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);

        if let Ok(mut kinds) = self.commands_by_kind.lock() {
            *kinds.entry(kind.to_string()).or_insert(0) += 1;
        }
        if let Ok(mut times) = self.delivery_times.lock() {
            times.push(elapsed.as_millis() as u64);
            if times.len() > MAX_DELIVERY_SAMPLES {
                times.remove(0);
            }
        }
    }

    pub fn command_failed(&self, attempts: u32) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
        self.command_retries
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
    }

    // Fail-safe and sweep
    pub fn failsafe_scheduled(&self) {
        self.failsafe_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failsafe_sent(&self) {
        self.failsafe_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failsafe_suppressed(&self) {
        self.failsafe_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweep_completed(&self, cleared: u64, failures: u64) {
        self.sweeps_run.fetch_add(1, Ordering::Relaxed);
        self.sweep_clears.fetch_add(cleared, Ordering::Relaxed);
        self.sweep_failures.fetch_add(failures, Ordering::Relaxed);
    }

    // Broker connectivity
    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_errored(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.messages_received,
            &self.messages_dropped,
            &self.devices_upserted,
            &self.status_updates,
            &self.commands_published,
            &self.commands_failed,
            &self.command_retries,
            &self.failsafe_scheduled,
            &self.failsafe_sent,
            &self.failsafe_suppressed,
            &self.sweeps_run,
            &self.sweep_clears,
            &self.sweep_failures,
            &self.connections_established,
            &self.disconnects,
            &self.connection_errors,
            &self.reconnect_attempts,
            &self.connection_start_time,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut kinds) = self.commands_by_kind.lock() {
            kinds.clear();
        }
        if let Ok(mut times) = self.delivery_times.lock() {
            times.clear();
        }
    }

    /// Average and percentiles of delivery times
    fn delivery_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.delivery_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start = self.connection_start_time.load(Ordering::Relaxed);
        if start > 0 {
            now.saturating_sub(start)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_delivery_time_ms, p50, p95) = self.delivery_time_statistics();
        let by_kind = self
            .commands_by_kind
            .lock()
            .map(|k| k.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            inbound: InboundMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
                devices_upserted: self.devices_upserted.load(Ordering::Relaxed),
                status_updates: self.status_updates.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                published: self.commands_published.load(Ordering::Relaxed),
                failed: self.commands_failed.load(Ordering::Relaxed),
                retries: self.command_retries.load(Ordering::Relaxed),
                by_kind,
                avg_delivery_time_ms,
                delivery_time_p50_ms: p50,
                delivery_time_p95_ms: p95,
            },
            failsafe: FailsafeMetrics {
                scheduled: self.failsafe_scheduled.load(Ordering::Relaxed),
                sent: self.failsafe_sent.load(Ordering::Relaxed),
                suppressed: self.failsafe_suppressed.load(Ordering::Relaxed),
            },
            sweep: SweepMetrics {
                runs: self.sweeps_run.load(Ordering::Relaxed),
                topics_cleared: self.sweep_clears.load(Ordering::Relaxed),
                failures: self.sweep_failures.load(Ordering::Relaxed),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                disconnects: self.disconnects.load(Ordering::Relaxed),
                connection_errors: self.connection_errors.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub inbound: InboundMetrics,
    pub commands: CommandMetrics,
    pub failsafe: FailsafeMetrics,
    pub sweep: SweepMetrics,
    pub mqtt: MqttMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundMetrics {
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub devices_upserted: u64,
    pub status_updates: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandMetrics {
    pub published: u64,
    pub failed: u64,
    pub retries: u64,
    pub by_kind: HashMap<String, u64>,
    pub avg_delivery_time_ms: f64,
    pub delivery_time_p50_ms: f64,
    pub delivery_time_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailsafeMetrics {
    pub scheduled: u64,
    pub sent: u64,
    pub suppressed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepMetrics {
    pub runs: u64,
    pub topics_cleared: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connections_established: u64,
    pub disconnects: u64,
    pub connection_errors: u64,
    pub reconnect_attempts: u64,
    pub connection_duration_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_command_metrics() {
        let collector = MetricsCollector::new();

        collector.command_published("ALARM_ON", 1, Duration::from_millis(20));
        collector.command_published("ALARM_OFF", 3, Duration::from_millis(2040));
        collector.command_failed(3);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.commands.published, 2);
        assert_eq!(metrics.commands.failed, 1);
        assert_eq!(metrics.commands.retries, 4);
        assert_eq!(metrics.commands.by_kind.get("ALARM_ON"), Some(&1));
        assert!(metrics.commands.avg_delivery_time_ms > 1000.0);
    }

    #[test]
    fn test_mqtt_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_established();
        assert!(collector.is_connected());
        collector.mqtt_connection_lost();
        collector.mqtt_reconnect_attempt();
        collector.mqtt_connection_established();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.mqtt.connections_established, 2);
        assert_eq!(metrics.mqtt.disconnects, 1);
        assert_eq!(metrics.mqtt.reconnect_attempts, 1);
        assert!(metrics.mqtt.connected);
    }

    #[test]
    fn test_failsafe_and_sweep_metrics() {
        let collector = MetricsCollector::new();

        collector.failsafe_scheduled();
        collector.failsafe_sent();
        collector.failsafe_suppressed();
        collector.failsafe_suppressed();
        collector.sweep_completed(4, 1);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.failsafe.scheduled, 1);
        assert_eq!(metrics.failsafe.sent, 1);
        assert_eq!(metrics.failsafe.suppressed, 2);
        assert_eq!(metrics.sweep.runs, 1);
        assert_eq!(metrics.sweep.topics_cleared, 4);
        assert_eq!(metrics.sweep.failures, 1);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.message_received();
                        collector.device_upserted();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.inbound.messages_received, 1000);
        assert_eq!(metrics.inbound.devices_upserted, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_delivery_samples_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.command_published("ALARM_OFF", 1, Duration::from_millis(i));
        }
        let len = collector.delivery_times.lock().unwrap().len();
        assert_eq!(len, MAX_DELIVERY_SAMPLES);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.message_received();
        collector.mqtt_connection_established();
        collector.command_published("DISCONNECT", 1, Duration::from_millis(5));

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.inbound.messages_received, 0);
        assert!(!metrics.mqtt.connected);
        assert!(metrics.commands.by_kind.is_empty());
    }
}
