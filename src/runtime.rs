//! Process plumbing: configuration, telemetry, fatal-error capture, and the
//! runner that wires every component together.

pub mod config;
pub mod fatal;
pub mod runner;
pub mod telemetry;
