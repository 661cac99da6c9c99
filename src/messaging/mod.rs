//! Device liveness and command delivery
//!
//! Inbound: transport → [`TopicRouter`] → [`DeviceReconciler`] → store, with
//! offline reports re-entering the [`CommandDispatcher`] as a fail-safe.
//! Outbound: [`CommandDispatcher`] resolves record → device → control topic and
//! publishes through the [`ConnectionManager`]'s session with bounded retry.
//! [`LivenessSweep`] clears stale retained snapshots on every (re)connect.

pub mod connection_manager;
pub mod dedup;
pub mod dispatcher;
pub mod reconciler;
pub mod retry;
pub mod router;
pub mod service;
pub mod sweep;

pub use connection_manager::ConnectionManager;
pub use dedup::DedupWindow;
pub use dispatcher::{CommandDispatcher, CommandReceipt, FailsafeReport, FailsafeSend};
pub use reconciler::{DeviceReconciler, Reconciled};
pub use retry::{execute_with_retry, Retried, RetryError, RetryPolicy, Sleeper, TokioSleeper};
pub use router::{RoutedMessage, SubscribeOutcome, TopicRouter};
pub use service::MessagingService;
pub use sweep::{LivenessSweep, SweepReport};
