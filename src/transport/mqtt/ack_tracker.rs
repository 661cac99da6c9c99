//! Pairing of QoS 1 publishes with their PUBACKs (pure bookkeeping)
//!
//! rumqttc hands requests to the event loop in FIFO order and reports each
//! written publish as `Outgoing::Publish(pkid)`. A waiter registered before its
//! request is enqueued is therefore matched with the next fresh packet id and
//! resolved when the broker acknowledges that id.
//!
//! After a connection loss rumqttc resends every unacknowledged publish under
//! its old packet id before anything new. A written publish that is not resent
//! was dropped by rumqttc, which happens to a publish the broker refused with a
//! negative PUBACK.
//!
//! Publishers must register and enqueue under one lock so queue order equals
//! request order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Broker verdict for one publish
pub type AckOutcome = Result<(), AckFailure>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckFailure {
    /// Negative PUBACK reason code
    Rejected(String),
    /// Not resent after a reconnect
    Dropped,
    /// The session was closed while waiting
    Closed,
}

type Waiter = oneshot::Sender<AckOutcome>;

#[derive(Debug, Default)]
struct AckState {
    /// Enqueued requests not yet written to the socket, oldest first
    queued: VecDeque<Waiter>,
    /// Written publishes waiting for a PUBACK
    inflight: HashMap<u16, Waiter>,
    /// Written before the last connection loss, not yet resent
    resend: HashMap<u16, Waiter>,
    /// Publish held back until `pkid` is acknowledged
    deferred: Option<(u16, Waiter)>,
    /// Broker refusal that ended the last connection
    rejection: Option<String>,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter for the request about to be enqueued
    pub fn register(&self) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut state) = self.state.lock() {
            state.queued.push_back(tx);
        }
        rx
    }

    /// Drop the most recent waiter after its request failed to enqueue
    pub fn withdraw_last(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.queued.pop_back();
        }
    }

    /// The event loop wrote a publish with `pkid`
    pub fn on_outgoing(&self, pkid: u16) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        if let Some(waiter) = state.resend.remove(&pkid) {
            debug!(pkid, "Resent unacknowledged publish");
            state.inflight.insert(pkid, waiter);
            return;
        }
        if state.inflight.contains_key(&pkid) {
            // Deferred publish written just before the PUBACK that freed its id
            return;
        }

        // Resends always come first, so whatever is left was dropped
        let failure = match state.rejection.take() {
            Some(reason) => AckFailure::Rejected(reason),
            None => AckFailure::Dropped,
        };
        for (_, waiter) in state.resend.drain() {
            let _ = waiter.send(Err(failure.clone()));
        }

        match state.queued.pop_front() {
            Some(waiter) => {
                state.inflight.insert(pkid, waiter);
            }
            None => debug!(pkid, "Outgoing publish without a waiter"),
        }
    }

    /// rumqttc holds the next publish back until `pkid` is acknowledged
    pub fn on_deferred(&self, pkid: u16) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(waiter) = state.queued.pop_front() {
                state.deferred = Some((pkid, waiter));
            }
        }
    }

    /// The broker accepted publish `pkid`
    pub fn on_ack(&self, pkid: u16) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        match state.inflight.remove(&pkid) {
            // The publisher may have timed out already
            Some(waiter) => {
                let _ = waiter.send(Ok(()));
            }
            None => debug!(pkid, "PUBACK for an unknown packet id"),
        }

        if matches!(&state.deferred, Some((deferred, _)) if *deferred == pkid) {
            if let Some((pkid, waiter)) = state.deferred.take() {
                state.inflight.insert(pkid, waiter);
            }
        }
    }

    /// Written publishes wait for their resend; `rejection` is the broker's
    /// reason when a negative PUBACK ended the connection
    pub fn on_connection_lost(&self, rejection: Option<String>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let inflight: Vec<_> = state.inflight.drain().collect();
        state.resend.extend(inflight);
        if rejection.is_some() {
            state.rejection = rejection;
        }
    }

    /// Fail every waiter
    pub fn close(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let mut waiters: Vec<Waiter> = state.queued.drain(..).collect();
        waiters.extend(state.inflight.drain().map(|(_, w)| w));
        waiters.extend(state.resend.drain().map(|(_, w)| w));
        waiters.extend(state.deferred.take().map(|(_, w)| w));
        for waiter in waiters {
            let _ = waiter.send(Err(AckFailure::Closed));
        }
    }

    /// Waiters not yet resolved
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.queued.len()
                    + s.inflight.len()
                    + s.resend.len()
                    + usize::from(s.deferred.is_some())
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    #[test]
    fn test_acks_resolve_by_packet_id() {
        let tracker = AckTracker::new();
        let mut first = tracker.register();
        let mut second = tracker.register();

        tracker.on_outgoing(7);
        tracker.on_outgoing(8);
        tracker.on_ack(8);

        assert_eq!(first.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(second.try_recv(), Ok(Ok(())));

        tracker.on_ack(7);
        assert_eq!(first.try_recv(), Ok(Ok(())));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_resent_publish_keeps_its_waiter() {
        let tracker = AckTracker::new();
        let mut written = tracker.register();
        let mut queued = tracker.register();
        tracker.on_outgoing(1);

        tracker.on_connection_lost(None);
        assert_eq!(written.try_recv(), Err(TryRecvError::Empty));

        // After reconnecting: the resend first, then the queued request
        tracker.on_outgoing(1);
        tracker.on_outgoing(2);
        tracker.on_ack(1);
        tracker.on_ack(2);

        assert_eq!(written.try_recv(), Ok(Ok(())));
        assert_eq!(queued.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn test_rejected_publish_is_not_resent() {
        let tracker = AckTracker::new();
        let mut refused = tracker.register();
        let mut accepted = tracker.register();
        let mut next = tracker.register();
        tracker.on_outgoing(1);
        tracker.on_outgoing(2);

        tracker.on_connection_lost(Some("NotAuthorized".to_string()));
        tracker.on_outgoing(2);
        tracker.on_outgoing(3);

        assert_eq!(
            refused.try_recv(),
            Ok(Err(AckFailure::Rejected("NotAuthorized".to_string())))
        );
        assert_eq!(accepted.try_recv(), Err(TryRecvError::Empty));
        tracker.on_ack(2);
        tracker.on_ack(3);
        assert_eq!(accepted.try_recv(), Ok(Ok(())));
        assert_eq!(next.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn test_deferred_publish_takes_over_freed_id() {
        let tracker = AckTracker::new();
        let mut old = tracker.register();
        let mut deferred = tracker.register();
        tracker.on_outgoing(1);
        tracker.on_deferred(1);

        // rumqttc writes the deferred publish before reporting the PUBACK
        tracker.on_outgoing(1);
        tracker.on_ack(1);
        assert_eq!(old.try_recv(), Ok(Ok(())));
        assert_eq!(deferred.try_recv(), Err(TryRecvError::Empty));

        tracker.on_ack(1);
        assert_eq!(deferred.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn test_withdrawn_waiter_is_not_matched() {
        let tracker = AckTracker::new();
        let mut kept = tracker.register();
        let _withdrawn = tracker.register();
        tracker.withdraw_last();

        tracker.on_outgoing(3);
        tracker.on_ack(3);

        assert_eq!(kept.try_recv(), Ok(Ok(())));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_close_fails_everything() {
        let tracker = AckTracker::new();
        let mut written = tracker.register();
        let mut queued = tracker.register();
        tracker.on_outgoing(1);

        tracker.close();

        assert_eq!(written.try_recv(), Ok(Err(AckFailure::Closed)));
        assert_eq!(queued.try_recv(), Ok(Err(AckFailure::Closed)));
        assert_eq!(tracker.pending(), 0);
    }
}
