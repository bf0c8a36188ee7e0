//! Decode SBS-1 (BaseStation) records as emitted by dump1090 on port 30003.
//!
//! One record per line, 22 comma-separated fields:
//!
//! ```text
//! MSG,3,1,1,4840D6,1,2015/05/12,12:34:56.789,2015/05/12,12:34:56.790,,35000,,,52.3,4.7,,,0,0,0,0
//! ```
//!
//! Empty or unparsable fields decode to `None`; only the message type and
//! the aircraft identifier decide whether a record is valid.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::types::normalize_icao;

/// SBS-1 transmission types (field 1 of a `MSG` record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    EsIdentAndCategory,
    EsSurfacePos,
    EsAirbornePos,
    EsAirborneVel,
    SurveillanceAlt,
    SurveillanceId,
    AirToAir,
    AllCallReply,
}

impl TransmissionType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::EsIdentAndCategory),
            2 => Some(Self::EsSurfacePos),
            3 => Some(Self::EsAirbornePos),
            4 => Some(Self::EsAirborneVel),
            5 => Some(Self::SurveillanceAlt),
            6 => Some(Self::SurveillanceId),
            7 => Some(Self::AirToAir),
            8 => Some(Self::AllCallReply),
            _ => None,
        }
    }
}

/// One decoded position/identity update for a single aircraft.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub valid: bool,
    pub transmission_type: Option<TransmissionType>,
    pub session_id: Option<String>,
    pub aircraft_id: Option<String>,
    pub icao24: Option<String>,
    pub flight_id: Option<String>,
    pub generated: Option<NaiveDateTime>,
    pub logged: Option<NaiveDateTime>,
    pub callsign: Option<String>,
    pub altitude: Option<i32>,
    pub ground_speed: Option<f64>,
    pub track: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub vertical_rate: Option<i32>,
    pub squawk: Option<u16>,
    pub alert: Option<bool>,
    pub emergency: Option<bool>,
    pub spi: Option<bool>,
    pub on_ground: Option<bool>,
}

impl Report {
    /// An otherwise empty valid report for `icao24`.
    pub fn for_aircraft(icao24: &str) -> Self {
        Report {
            valid: true,
            icao24: normalize_icao(icao24),
            ..Default::default()
        }
    }

    /// A report is usable only if it is a `MSG` record with an identifier.
    pub fn is_valid(&self) -> bool {
        self.valid && self.icao24.is_some()
    }

    pub fn icao24(&self) -> Option<&str> {
        self.icao24.as_deref()
    }
}

/// Decode a single SBS-1 record. Never fails; malformed input yields an
/// invalid report.
pub fn decode(raw: &[u8]) -> Report {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\r', '\n']);
    let parts: Vec<&str> = line.split(',').collect();

    let icao24 = field(&parts, 4).and_then(normalize_icao);
    let valid = field(&parts, 0) == Some("MSG") && icao24.is_some();

    Report {
        valid,
        transmission_type: parse_int(&parts, 1).and_then(TransmissionType::from_code),
        session_id: parse_string(&parts, 2),
        aircraft_id: parse_string(&parts, 3),
        icao24,
        flight_id: parse_string(&parts, 5),
        generated: parse_datetime(&parts, 6, 7),
        logged: parse_datetime(&parts, 8, 9),
        callsign: parse_string(&parts, 10)
            .map(|cs| cs.trim().to_string())
            .filter(|cs| !cs.is_empty()),
        altitude: parse_int(&parts, 11).and_then(|v| i32::try_from(v).ok()),
        ground_speed: parse_float(&parts, 12),
        track: parse_float(&parts, 13),
        lat: parse_float(&parts, 14),
        lon: parse_float(&parts, 15),
        vertical_rate: parse_int(&parts, 16).and_then(|v| i32::try_from(v).ok()),
        squawk: parse_int(&parts, 17).and_then(|v| u16::try_from(v).ok()),
        alert: parse_bool(&parts, 18),
        emergency: parse_bool(&parts, 19),
        spi: parse_bool(&parts, 20),
        on_ground: parse_bool(&parts, 21),
    }
}

// ---------------------------------------------------------------------------
// Field parsers
// ---------------------------------------------------------------------------

fn field<'a>(parts: &[&'a str], index: usize) -> Option<&'a str> {
    parts
        .get(index)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

fn parse_string(parts: &[&str], index: usize) -> Option<String> {
    field(parts, index).map(str::to_string)
}

fn parse_int(parts: &[&str], index: usize) -> Option<i64> {
    field(parts, index)?.parse().ok()
}

fn parse_float(parts: &[&str], index: usize) -> Option<f64> {
    field(parts, index)?.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// dump1090 writes flags as `0` / `-1`; any non-zero integer is true.
fn parse_bool(parts: &[&str], index: usize) -> Option<bool> {
    parse_int(parts, index).map(|v| v != 0)
}

fn parse_datetime(parts: &[&str], date_index: usize, time_index: usize) -> Option<NaiveDateTime> {
    let date = field(parts, date_index)?;
    let time = field(parts, time_index)?;
    let date = NaiveDate::parse_from_str(date, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(date, "%Y-%m-%d"))
        .ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S%.f").ok()?;
    Some(date.and_time(time))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
