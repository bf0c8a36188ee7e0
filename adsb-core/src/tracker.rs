//! Per-aircraft observation state machine.
//!
//! Pure logic with no I/O and no clock reads. The caller supplies the current
//! `Instant` and any metadata it looked up, and gets back the state that
//! should be published (if any). Serialization of a `TrackedAircraft` is the
//! JSON document sent to the bus.
//!
//! Lifecycle of one aircraft:
//! - created on the first valid report for its identifier,
//! - merged with every later report (non-null fields overwrite),
//! - published whenever it is presentable and something changed,
//! - evicted once after a period of silence, with one final `lost` publish.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::sbs1::Report;
use crate::types::AircraftInfo;

/// Aircraft are evicted after this many seconds without a report.
pub const STALE_TIMEOUT: f64 = 30.0;

// ---------------------------------------------------------------------------
// Tracked aircraft
// ---------------------------------------------------------------------------

/// Accumulated knowledge of one aircraft.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedAircraft {
    pub icao24: String,
    pub logged_date: Option<NaiveDateTime>,
    pub callsign: Option<String>,
    pub altitude: Option<i32>,
    pub ground_speed: Option<f64>,
    pub track: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Never null downstream; zero until a report supplies a value.
    pub vertical_rate: i32,
    pub operator: Option<String>,
    pub registration: Option<String>,
    #[serde(rename = "type")]
    pub aircraft_type: Option<String>,
    pub lost: bool,

    #[serde(skip)]
    pub last_seen: Instant,
    #[serde(skip)]
    dirty: bool,
}

impl TrackedAircraft {
    fn new(icao24: String, now: Instant) -> Self {
        TrackedAircraft {
            icao24,
            logged_date: None,
            callsign: None,
            altitude: None,
            ground_speed: None,
            track: None,
            lat: None,
            lon: None,
            vertical_rate: 0,
            operator: None,
            registration: None,
            aircraft_type: None,
            lost: false,
            last_seen: now,
            dirty: true,
        }
    }

    /// All core kinematic fields are known.
    pub fn is_presentable(&self) -> bool {
        self.altitude.is_some()
            && self.ground_speed.is_some()
            && self.track.is_some()
            && self.lat.is_some()
            && self.lon.is_some()
    }

    /// Has unpublished changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        self.age(now) > stale_after
    }

    /// Merge a report into this state. Returns true if any compared field
    /// changed. The logged timestamp is updated but not compared.
    fn merge(&mut self, report: &Report, info: Option<&AircraftInfo>) -> bool {
        if report.logged.is_some() {
            self.logged_date = report.logged;
        }

        let mut changed = false;
        changed |= overwrite(&mut self.callsign, report.callsign.clone());
        changed |= overwrite(&mut self.altitude, report.altitude);
        changed |= overwrite(&mut self.ground_speed, report.ground_speed);
        changed |= overwrite(&mut self.track, report.track);
        changed |= overwrite(&mut self.lat, report.lat);
        changed |= overwrite(&mut self.lon, report.lon);
        if let Some(vr) = report.vertical_rate {
            changed |= vr != self.vertical_rate;
            self.vertical_rate = vr;
        }

        if let Some(info) = info {
            changed |= assign(&mut self.registration, info.registration.clone());
            changed |= assign(&mut self.aircraft_type, info.type_name());
            changed |= assign(&mut self.operator, info.operator.clone());
        }

        changed
    }
}

/// Replace `slot` only when the incoming value is known.
fn overwrite<T: PartialEq>(slot: &mut Option<T>, incoming: Option<T>) -> bool {
    match incoming {
        Some(v) if slot.as_ref() != Some(&v) => {
            *slot = Some(v);
            true
        }
        _ => false,
    }
}

/// Replace `slot` unconditionally (metadata snapshots are authoritative).
fn assign<T: PartialEq>(slot: &mut Option<T>, value: Option<T>) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

// ---------------------------------------------------------------------------
// Observation table
// ---------------------------------------------------------------------------

/// All aircraft currently considered live, keyed by identifier.
#[derive(Debug, Default)]
pub struct ObservationTable {
    aircraft: HashMap<String, TrackedAircraft>,

    // Counters
    pub reports_applied: u64,
    pub published: u64,
    pub evicted: u64,
}

impl ObservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one report.
    ///
    /// `info` is the metadata lookup result for the report's identifier,
    /// `None` when lookup is disabled or the aircraft is unknown (existing
    /// metadata is then left as is). Returns the state to publish when the
    /// merged aircraft is presentable and changed; the dirty flag is cleared
    /// in that case.
    pub fn apply(
        &mut self,
        report: &Report,
        info: Option<&AircraftInfo>,
        now: Instant,
    ) -> Option<&TrackedAircraft> {
        if !report.is_valid() {
            return None;
        }
        let icao24 = report.icao24()?;
        self.reports_applied += 1;

        let ac = match self.aircraft.entry(icao24.to_string()) {
            Entry::Occupied(entry) => {
                let ac = entry.into_mut();
                ac.dirty = ac.merge(report, info);
                ac
            }
            Entry::Vacant(entry) => {
                // No prior state to compare against: always dirty
                let mut ac = TrackedAircraft::new(icao24.to_string(), now);
                ac.merge(report, info);
                entry.insert(ac)
            }
        };
        ac.last_seen = now;

        if ac.is_presentable() && ac.dirty {
            ac.dirty = false;
            self.published += 1;
            Some(ac)
        } else {
            None
        }
    }

    /// Remove every aircraft silent for longer than `stale_after`.
    ///
    /// Returned entries are marked `lost`; each identifier is returned at
    /// most once since it no longer exists in the table afterwards.
    pub fn evict(&mut self, now: Instant, stale_after: Duration) -> Vec<TrackedAircraft> {
        let stale: Vec<String> = self
            .aircraft
            .iter()
            .filter(|(_, ac)| ac.is_stale(now, stale_after))
            .map(|(k, _)| k.clone())
            .collect();

        let mut lost = Vec::with_capacity(stale.len());
        for icao24 in stale {
            if let Some(mut ac) = self.aircraft.remove(&icao24) {
                ac.lost = true;
                lost.push(ac);
            }
        }
        self.evicted += lost.len() as u64;
        lost
    }

    pub fn get(&self, icao24: &str) -> Option<&TrackedAircraft> {
        self.aircraft.get(icao24)
    }

    pub fn contains(&self, icao24: &str) -> bool {
        self.aircraft.contains_key(icao24)
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
