//! Testing utilities and mock implementations
//!
//! Mocks for the discovery backend and the broker connection, so the session can be
//! driven end to end without a network or a broker.

pub mod mocks;

pub use mocks::*;
