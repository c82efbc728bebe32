//! Library crate for lan-sentinel: LAN sweeps, scan records, archiving and live events.
pub mod aggregate;
pub mod archive;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod latency;
pub mod markup;
pub mod netdetect;
pub mod orchestrator;
pub mod ports;
pub mod server;
pub mod services;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod xml;
