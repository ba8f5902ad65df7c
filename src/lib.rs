//! Njord Core — telemetry and execution-orchestration core.
//!
//! Exposes the bus, metric registry/aggregator/retention/alerting stack,
//! the execution-algorithm runtime, and the deterministic backtest engine
//! as a library so that the service binaries under `src/bin/` can stay
//! thin composition roots.

pub mod bus;
pub mod config;
pub mod execution;
pub mod telemetry;

pub mod backtest;

pub use bus::Bus;
