//! adsb-core: SBS-1 decoding and aircraft observation tracking.
//!
//! No async and no I/O, only parsing and state. This crate is the shared core
//! used by `adsb-bridge`, which owns the sockets, the MQTT session and the
//! clock.

pub mod config;
pub mod sbs1;
pub mod tracker;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{Config, MqttAuth};
pub use sbs1::{decode, Report};
pub use tracker::{ObservationTable, TrackedAircraft};
pub use types::*;
