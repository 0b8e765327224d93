//! Observability for the session core
//!
//! Structured logging through `tracing`, with span macros for the discovery,
//! transport and controller layers.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{discovery_span, mqtt_span, session_span};
