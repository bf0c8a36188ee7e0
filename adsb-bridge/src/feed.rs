//! Feed reader: SBS-1 over TCP into the observation table.
//!
//! ```text
//! Disconnected --connect ok--> Streaming --read error / timeout / EOF--> Disconnected
//!      ^    \--connect failed--> (backoff) --/                                |
//!      \------------------------------(backoff)-------------------------------/
//! ```
//!
//! While streaming, every decoded report is applied to the table and any
//! resulting publish decision is sent to the bridge. A periodic sweep evicts
//! silent aircraft and publishes their final `lost` document.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, error, info, warn};

use adsb_core::config::{Config, TimingConfig};
use adsb_core::{sbs1, AircraftInfo, ObservationTable, Report, TrackedAircraft};

use crate::bridge::Publisher;
use crate::error::{Error, Result};
use crate::planedb::AircraftLookup;

/// Partial lines longer than this are discarded.
pub const MAX_LINE_LENGTH: usize = 1024;

// ---------------------------------------------------------------------------
// Line codec
// ---------------------------------------------------------------------------

/// Splits the feed into lines and decodes each one as an SBS-1 record.
#[derive(Debug, Default)]
pub struct Sbs1Codec {
    discarding: bool,
}

impl Sbs1Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Sbs1Codec {
    type Item = Report;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Report>> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    // Drop the oversized fragment and the rest of its line
                    src.clear();
                    self.discarding = true;
                }
                return Ok(None);
            };

            let line = src.split_to(pos + 1);
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let line = trim_line(&line);
            if line.is_empty() {
                continue;
            }
            return Ok(Some(sbs1::decode(line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Report>> {
        if let Some(report) = self.decode(src)? {
            return Ok(Some(report));
        }
        if src.is_empty() || std::mem::take(&mut self.discarding) {
            src.clear();
            return Ok(None);
        }
        let line = src.split_to(src.len());
        let line = trim_line(&line);
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(sbs1::decode(line)))
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &line[..end]
}

// ---------------------------------------------------------------------------
// Feed reader
// ---------------------------------------------------------------------------

pub struct FeedReader<P> {
    addr: String,
    topic: String,
    timing: TimingConfig,
    table: ObservationTable,
    publisher: P,
    lookup: Option<Arc<dyn AircraftLookup>>,
    conn_warned: bool,
}

impl<P: Publisher> FeedReader<P> {
    pub fn new(config: &Config, publisher: P, lookup: Option<Arc<dyn AircraftLookup>>) -> Self {
        FeedReader {
            addr: format!("{}:{}", config.feed.host, config.feed.port),
            topic: config.topic(),
            timing: config.timing.clone(),
            table: ObservationTable::new(),
            publisher,
            lookup,
            conn_warned: false,
        }
    }

    pub fn table(&self) -> &ObservationTable {
        &self.table
    }

    /// Read the feed forever, reconnecting after a fixed backoff.
    pub async fn run(mut self) {
        loop {
            match self.connect().await {
                Ok(stream) => {
                    if let Err(e) = self.stream(stream).await {
                        error!("ADS-B feed lost: {e}");
                    }
                }
                Err(e) => {
                    self.connect_failed(&e);
                }
            }
            sleep(self.timing.feed_backoff()).await;
        }
    }

    /// Log a failed connection attempt. Only the first failure of a streak
    /// is logged as an error; returns whether this one was.
    fn connect_failed(&mut self, e: &Error) -> bool {
        let first = !self.conn_warned;
        if first {
            error!("{e}, retrying every {:?}", self.timing.feed_backoff());
        } else {
            debug!("{e}");
        }
        self.conn_warned = true;
        first
    }

    async fn connect(&mut self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::FeedConnect {
                addr: self.addr.clone(),
                source: e,
            })?;
        info!("ADS-B feed connected to {}", self.addr);
        self.conn_warned = false;
        Ok(stream)
    }

    /// Stream reports until the connection fails. Always returns an error.
    pub async fn stream(&mut self, stream: TcpStream) -> Result<()> {
        let read_timeout = self.timing.read_timeout();
        let sweep_interval = self.timing.sweep_interval();
        let mut frames = FramedRead::new(stream, Sbs1Codec::new());
        let mut deadline = Instant::now() + read_timeout;
        let mut next_sweep = Instant::now() + sweep_interval;

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(report)) => {
                        deadline = Instant::now() + read_timeout;
                        self.handle_report(report).await;
                    }
                    Some(Err(e)) => return Err(Error::FeedRead(e)),
                    None => return Err(Error::FeedClosed),
                },
                _ = sleep_until(next_sweep) => {
                    self.sweep();
                    next_sweep = Instant::now() + sweep_interval;
                }
                _ = sleep_until(deadline) => return Err(Error::FeedTimeout(read_timeout)),
            }
        }
    }

    /// Apply one decoded report and publish the result if it changed.
    pub async fn handle_report(&mut self, report: Report) {
        let Some(icao24) = report.icao24().filter(|_| report.is_valid()) else {
            debug!("Dropping invalid SBS-1 record");
            return;
        };

        let info = self.lookup_metadata(icao24).await;
        let now = Instant::now().into_std();
        if let Some(ac) = self.table.apply(&report, info.as_ref(), now) {
            publish_state(&self.publisher, &self.topic, ac);
            debug!(
                "> {} {} - {} {} ({}), trk:{:?} spd:{:?} alt:{:?} {:?}, {:?}",
                ac.icao24,
                ac.callsign.as_deref().unwrap_or("-"),
                ac.operator.as_deref().unwrap_or("-"),
                ac.aircraft_type.as_deref().unwrap_or("-"),
                ac.registration.as_deref().unwrap_or("-"),
                ac.track,
                ac.ground_speed,
                ac.altitude,
                ac.lat,
                ac.lon
            );
        }
    }

    async fn lookup_metadata(&self, icao24: &str) -> Option<AircraftInfo> {
        let lookup = self.lookup.as_ref()?;
        match lookup.lookup(icao24).await {
            Ok(Some(info)) => Some(info),
            Ok(None) => {
                debug!("icao24 {icao24} not found in the aircraft database");
                None
            }
            Err(Error::LookupSuspended(_)) => None,
            Err(e) => {
                warn!("{e}");
                None
            }
        }
    }

    /// Evict silent aircraft and publish their final document.
    pub fn sweep(&mut self) {
        let now = Instant::now().into_std();
        for ac in self.table.evict(now, self.timing.stale_after()) {
            publish_state(&self.publisher, &self.topic, &ac);
            debug!("{} lost", ac.icao24);
        }
        debug!(
            "Tracking {} aircraft ({} reports, {} published, {} lost)",
            self.table.len(),
            self.table.reports_applied,
            self.table.published,
            self.table.evicted
        );
    }
}

fn publish_state<P: Publisher>(publisher: &P, topic: &str, ac: &TrackedAircraft) {
    match serde_json::to_string(ac) {
        Ok(payload) => publisher.publish(topic, payload),
        Err(e) => warn!("Failed to serialize {}: {e}", ac.icao24),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
