//! Suppression of identical publishes inside a time window

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// `(topic, payload) -> last accepted instant`
///
/// Only accepted sends refresh the timestamp, so a steady stream of duplicates
/// still gets one publish per window.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    last_sent: Mutex<HashMap<(String, Vec<u8>), Instant>>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true when the caller may publish now
    pub fn try_acquire(&self, topic: &str, payload: &[u8]) -> bool {
        self.try_acquire_at(topic, payload, Instant::now())
    }

    pub fn try_acquire_at(&self, topic: &str, payload: &[u8], now: Instant) -> bool {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            // A poisoned map only loses suppression, never a send
            return true;
        };

        let window = self.window;
        last_sent.retain(|_, sent_at| now.saturating_duration_since(*sent_at) < window);

        let key = (topic.to_string(), payload.to_vec());
        if last_sent.contains_key(&key) {
            return false;
        }
        last_sent.insert(key, now);
        true
    }

    /// Forget `(topic, payload)` so the next identical send goes through
    pub fn release(&self, topic: &str, payload: &[u8]) {
        if let Ok(mut last_sent) = self.last_sent.lock() {
            last_sent.remove(&(topic.to_string(), payload.to_vec()));
        }
    }

    /// Number of keys still inside their window
    pub fn len(&self) -> usize {
        self.last_sent.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
