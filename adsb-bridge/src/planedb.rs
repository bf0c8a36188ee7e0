//! Aircraft metadata lookup against a planedb HTTP service.
//!
//! `GET http://<host>:<port>/aircraft/<icao24>` answers with
//! `{registration, manufacturer, model, operator}` or 404 for unknown
//! aircraft. Results (hits and misses) are cached per identifier so the
//! service is not queried for every report.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;

use adsb_core::config::PlaneDbConfig;
use adsb_core::AircraftInfo;

use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// After a failed request the service is not queried again for this long.
pub const RETRY_AFTER: Duration = Duration::from_secs(30);

/// Maps an aircraft identifier to static metadata.
#[async_trait]
pub trait AircraftLookup: Send + Sync {
    /// `Ok(None)` means the aircraft is unknown, which is not an error.
    async fn lookup(&self, icao24: &str) -> Result<Option<AircraftInfo>>;
}

struct CacheEntry {
    fetched: Instant,
    info: Option<AircraftInfo>,
}

struct Cache {
    entries: HashMap<String, CacheEntry>,
    last_pruned: Instant,
    suspended_until: Option<Instant>,
}

pub struct PlaneDb {
    base_url: String,
    client: reqwest::Client,
    ttl: Duration,
    cache: Mutex<Cache>,
}

impl PlaneDb {
    pub fn new(base_url: &str, ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(PlaneDb {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            ttl,
            cache: Mutex::new(Cache {
                entries: HashMap::new(),
                last_pruned: Instant::now(),
                suspended_until: None,
            }),
        })
    }

    /// Build a client from configuration; `None` when lookups are disabled.
    pub fn from_config(config: &PlaneDbConfig) -> Result<Option<Self>> {
        match config.base_url() {
            Some(url) => Ok(Some(PlaneDb::new(&url, config.cache_ttl())?)),
            None => Ok(None),
        }
    }

    pub fn url_for(&self, icao24: &str) -> String {
        format!("{}/aircraft/{}", self.base_url, icao24)
    }

    fn cached(&self, icao24: &str, now: Instant) -> Option<Option<AircraftInfo>> {
        let mut cache = self.cache.lock().ok()?;
        match cache.entries.get(icao24) {
            Some(entry) if now.saturating_duration_since(entry.fetched) <= self.ttl => {
                Some(entry.info.clone())
            }
            Some(_) => {
                cache.entries.remove(icao24);
                None
            }
            None => None,
        }
    }

    /// Store a result. Expired entries are dropped at most once per TTL.
    fn remember(&self, icao24: &str, info: Option<AircraftInfo>, now: Instant) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if now.saturating_duration_since(cache.last_pruned) >= self.ttl {
            let ttl = self.ttl;
            cache
                .entries
                .retain(|_, e| now.saturating_duration_since(e.fetched) <= ttl);
            cache.last_pruned = now;
        }
        cache.entries.insert(
            icao24.to_string(),
            CacheEntry {
                fetched: now,
                info,
            },
        );
    }

    fn suspended(&self, now: Instant) -> bool {
        match self.cache.lock() {
            Ok(cache) => cache.suspended_until.is_some_and(|until| now < until),
            Err(_) => false,
        }
    }

    fn suspend(&self, now: Instant) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.suspended_until = Some(now + RETRY_AFTER);
        }
    }

    async fn fetch(&self, icao24: &str) -> Result<Option<AircraftInfo>> {
        let response = self.client.get(self.url_for(icao24)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<AircraftInfo>().await?)),
            status => Err(Error::LookupStatus {
                icao24: icao24.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl AircraftLookup for PlaneDb {
    async fn lookup(&self, icao24: &str) -> Result<Option<AircraftInfo>> {
        if let Some(hit) = self.cached(icao24, Instant::now()) {
            return Ok(hit);
        }
        if self.suspended(Instant::now()) {
            return Err(Error::LookupSuspended(RETRY_AFTER));
        }
        match self.fetch(icao24).await {
            Ok(info) => {
                self.remember(icao24, info.clone(), Instant::now());
                Ok(info)
            }
            Err(e) => {
                // A failing service would otherwise stall every report
                self.suspend(Instant::now());
                Err(e)
            }
        }
    }
}
