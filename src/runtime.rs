//! Runtime glue: configuration, subscriber hooks, fatal-error capture,
//! telemetry and the node that wires the subsystems together.

pub mod config;
pub mod fatal;
pub(crate) mod hooks;
pub(crate) mod lifecycle;
pub mod node;
pub mod protocol;
pub mod telemetry;
