//! Shared types, error enum, and aircraft metadata for adsb-core.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by adsb-core.
#[derive(Debug, Error)]
pub enum AdsbError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AdsbError>;

// ---------------------------------------------------------------------------
// Aircraft identifier helpers
// ---------------------------------------------------------------------------

/// Normalize an aircraft identifier as it appears in the feed.
///
/// Returns `None` for empty identifiers. Hex addresses are upper-cased so
/// that `4840d6` and `4840D6` track as the same aircraft.
pub fn normalize_icao(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_uppercase())
}

// ---------------------------------------------------------------------------
// Aircraft metadata
// ---------------------------------------------------------------------------

/// Static aircraft metadata as returned by the aircraft database service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AircraftInfo {
    #[serde(default)]
    pub registration: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
}

impl AircraftInfo {
    /// Human-readable type string: manufacturer and model joined by a space.
    pub fn type_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.manufacturer.as_deref(), self.model.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
