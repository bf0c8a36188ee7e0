//! Error type for the bridge daemon.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read certificate {path}: {source}")]
    Certificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to feed at {addr}: {source}")]
    FeedConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("feed read error: {0}")]
    FeedRead(#[from] std::io::Error),

    #[error("no data from feed for {0:?}")]
    FeedTimeout(Duration),

    #[error("feed closed the connection")]
    FeedClosed,

    #[error("aircraft lookup failed: {0}")]
    Lookup(#[from] reqwest::Error),

    #[error("aircraft lookup for {icao24} returned HTTP {status}")]
    LookupStatus { icao24: String, status: u16 },

    #[error("aircraft lookups suspended for {0:?} after a failure")]
    LookupSuspended(Duration),

    #[error("invalid remote log host '{0}'")]
    RemoteLogHost(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
