//! Testing utilities and mock implementations
//!
//! Lets the messaging core run without a broker: sessions, a sleeper that
//! never waits and a store that always fails.

pub mod mocks;

pub use mocks::*;
