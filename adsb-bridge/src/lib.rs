//! adsb-bridge: follow a dump1090 SBS-1 feed and publish aircraft state over MQTT.
//!
//! Two long-running tasks share nothing but a [`BridgeHandle`]:
//! the [`FeedReader`] owns the socket and the observation table, the
//! [`Bridge`] owns the MQTT session.

pub mod bridge;
pub mod error;
pub mod feed;
pub mod logging;
pub mod planedb;

pub use bridge::{Bridge, BridgeHandle, Publisher};
pub use error::{Error, Result};
pub use feed::{FeedReader, Sbs1Codec};
pub use planedb::{AircraftLookup, PlaneDb};
