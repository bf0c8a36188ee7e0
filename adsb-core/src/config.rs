//! Bridge configuration.
//!
//! Built once at startup from an optional TOML file plus command-line
//! overrides, validated, then handed by reference to each component.
//!
//! ```toml
//! radar_name = "home"
//!
//! [mqtt]
//! host = "broker.example.com"
//! username = "adsb"
//! password = "secret"
//!
//! [feed]
//! host = "127.0.0.1"
//! port = 30003
//!
//! [timing]
//! stale_after = 30.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AdsbError, Result};

/// Default MQTT port without TLS.
pub const MQTT_PORT: u16 = 1883;

/// Port used when connecting with a certificate bundle.
pub const MQTT_TLS_PORT: u16 = 443;

/// ALPN protocol id that lets managed IoT gateways accept MQTT on port 443.
pub const IOT_ALPN_PROTOCOL: &str = "x-amzn-mqtt-ca";

/// Full configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Radar (source) name, used in the topic `/adsb/<radar_name>/json`.
    pub radar_name: String,
    pub mqtt: MqttConfig,
    pub feed: FeedConfig,
    pub planedb: PlaneDbConfig,
    pub logging: LoggingConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    /// Explicit port; when unset the port follows the authentication mode.
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Negotiate the IoT-gateway ALPN protocol (requires certificates).
    pub aws_iot: bool,
    /// Keep-alive interval in seconds.
    pub keep_alive: u64,
    pub client_id_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneDbConfig {
    /// Aircraft database host; lookups are disabled when unset.
    pub host: Option<String>,
    pub port: u16,
    /// Seconds a lookup result (hit or miss) is reused.
    pub cache_ttl: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub verbose: bool,
    /// Remote log host as `host` or `host:port` (UDP).
    pub remote_host: Option<String>,
}

/// Fixed retry and sweep intervals, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait between feed connection attempts.
    pub feed_backoff: f64,
    /// Feed connection is dropped after this long without data.
    pub read_timeout: f64,
    /// Interval between eviction sweeps.
    pub sweep_interval: f64,
    /// Aircraft silent for longer than this are reported lost.
    pub stale_after: f64,
    /// Wait between MQTT connection attempts.
    pub mqtt_retry: f64,
    /// Upper bound for one MQTT event loop poll.
    pub mqtt_poll_interval: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            radar_name: "radar".into(),
            mqtt: MqttConfig::default(),
            feed: FeedConfig::default(),
            planedb: PlaneDbConfig::default(),
            logging: LoggingConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            host: "127.0.0.1".into(),
            port: None,
            username: None,
            password: None,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            aws_iot: false,
            keep_alive: 60,
            client_id_prefix: "adsbclient".into(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            host: "127.0.0.1".into(),
            port: 30003,
        }
    }
}

impl Default for PlaneDbConfig {
    fn default() -> Self {
        PlaneDbConfig {
            host: None,
            port: 31541,
            cache_ttl: 600.0,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            feed_backoff: 10.0,
            read_timeout: 60.0,
            sweep_interval: 5.0,
            stale_after: crate::tracker::STALE_TIMEOUT,
            mqtt_retry: 2.0,
            mqtt_poll_interval: 0.1,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| AdsbError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| AdsbError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Topic every aircraft document is published to.
    pub fn topic(&self) -> String {
        format!("/adsb/{}/json", self.radar_name)
    }

    /// Check the configuration and resolve the MQTT authentication mode.
    ///
    /// A configuration that fails here must not be run: the bridge would
    /// otherwise start half-configured.
    pub fn validate(&self) -> Result<MqttAuth> {
        if self.radar_name.is_empty() {
            return Err(AdsbError::Config("radar name cannot be empty".into()));
        }
        if self.radar_name.contains(['/', '+', '#']) {
            return Err(AdsbError::Config(format!(
                "radar name '{}' must not contain '/', '+' or '#'",
                self.radar_name
            )));
        }
        if self.mqtt.host.is_empty() {
            return Err(AdsbError::Config("MQTT host cannot be empty".into()));
        }
        if self.feed.host.is_empty() {
            return Err(AdsbError::Config("feed host cannot be empty".into()));
        }
        if self.planedb.host.as_deref() == Some("") {
            return Err(AdsbError::Config("planedb host cannot be empty".into()));
        }
        self.timing.validate()?;
        self.mqtt.auth()
    }
}

/// How the bridge authenticates against the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttAuth {
    Anonymous,
    Credentials {
        username: String,
        password: String,
    },
    Certificates {
        ca_cert: PathBuf,
        client_cert: PathBuf,
        client_key: PathBuf,
        /// Negotiate [`IOT_ALPN_PROTOCOL`].
        alpn: bool,
    },
}

impl MqttConfig {
    /// Resolve the authentication mode, rejecting invalid combinations.
    ///
    /// Credentials take precedence: when both a username/password pair and
    /// certificates are given, the certificates are not used.
    pub fn auth(&self) -> Result<MqttAuth> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                return Ok(MqttAuth::Credentials {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            (None, None) => {}
            _ => {
                return Err(AdsbError::Config(
                    "MQTT username and password must be given together".into(),
                ))
            }
        }

        let certs = [&self.ca_cert, &self.client_cert, &self.client_key];
        let given = certs.iter().filter(|c| c.is_some()).count();
        if given > 0 && given < certs.len() {
            return Err(AdsbError::Config(
                "certificate bundle needs a CA certificate, a client certificate and a key".into(),
            ));
        }
        if self.aws_iot && given == 0 {
            return Err(AdsbError::Config(
                "IoT gateway mode requires a certificate bundle".into(),
            ));
        }

        match (&self.ca_cert, &self.client_cert, &self.client_key) {
            (Some(ca), Some(cert), Some(key)) => {
                for path in [ca, cert, key] {
                    if !path.is_file() {
                        return Err(AdsbError::Config(format!(
                            "certificate file not found: {}",
                            path.display()
                        )));
                    }
                }
                Ok(MqttAuth::Certificates {
                    ca_cert: ca.clone(),
                    client_cert: cert.clone(),
                    client_key: key.clone(),
                    alpn: self.aws_iot,
                })
            }
            _ => Ok(MqttAuth::Anonymous),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// A complete certificate bundle is configured and will be used.
    pub fn uses_certificates(&self) -> bool {
        !self.has_credentials()
            && self.ca_cert.is_some()
            && self.client_cert.is_some()
            && self.client_key.is_some()
    }

    /// Certificates are configured but shadowed by credentials.
    pub fn ignores_certificates(&self) -> bool {
        self.has_credentials()
            && (self.ca_cert.is_some() || self.client_cert.is_some() || self.client_key.is_some())
    }

    /// Explicit port, else 443 with certificates, else 1883.
    pub fn effective_port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.uses_certificates() => MQTT_TLS_PORT,
            None => MQTT_PORT,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }
}

impl PlaneDbConfig {
    /// Base URL of the aircraft database, if lookups are enabled.
    pub fn base_url(&self) -> Option<String> {
        self.host
            .as_ref()
            .map(|host| format!("http://{}:{}", host, self.port))
    }

    pub fn cache_ttl(&self) -> Duration {
        seconds(self.cache_ttl)
    }
}

impl TimingConfig {
    fn validate(&self) -> Result<()> {
        let fields = [
            ("feed_backoff", self.feed_backoff),
            ("read_timeout", self.read_timeout),
            ("sweep_interval", self.sweep_interval),
            ("stale_after", self.stale_after),
            ("mqtt_retry", self.mqtt_retry),
            ("mqtt_poll_interval", self.mqtt_poll_interval),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value <= 0.0 {
                return Err(AdsbError::Config(format!(
                    "timing.{name} must be a positive number of seconds, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn feed_backoff(&self) -> Duration {
        seconds(self.feed_backoff)
    }

    pub fn read_timeout(&self) -> Duration {
        seconds(self.read_timeout)
    }

    pub fn sweep_interval(&self) -> Duration {
        seconds(self.sweep_interval)
    }

    pub fn stale_after(&self) -> Duration {
        seconds(self.stale_after)
    }

    pub fn mqtt_retry(&self) -> Duration {
        seconds(self.mqtt_retry)
    }

    pub fn mqtt_poll_interval(&self) -> Duration {
        seconds(self.mqtt_poll_interval)
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
