//! adsb-bridge: dump1090 SBS-1 feed to MQTT.
//!
//! Settings come from an optional TOML file, then environment variables and
//! command-line flags override individual values.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};

use adsb_bridge::{logging, AircraftLookup, Bridge, FeedReader, PlaneDb};
use adsb_core::Config;

/// How long a clean shutdown may take to flush the MQTT disconnect.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(
    name = "adsb-bridge",
    version,
    about = "Track aircraft from a dump1090 SBS-1 feed and publish them over MQTT"
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "ADSB_CONFIG")]
    config: Option<PathBuf>,

    /// Radar name, used in the topic /adsb/<name>/json
    #[arg(short = 'r', long, env = "ADSB_RADAR_NAME")]
    radar_name: Option<String>,

    /// MQTT broker host
    #[arg(short = 'm', long, env = "ADSB_MQTT_HOST")]
    mqtt_host: Option<String>,

    /// MQTT broker port (default 1883, or 443 with certificates)
    #[arg(short = 'p', long, env = "ADSB_MQTT_PORT")]
    mqtt_port: Option<u16>,

    /// MQTT username
    #[arg(short = 'u', long, env = "ADSB_MQTT_USER")]
    mqtt_user: Option<String>,

    /// MQTT password
    #[arg(short = 'a', long, env = "ADSB_MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// CA certificate (PEM)
    #[arg(long, env = "ADSB_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Client certificate (PEM)
    #[arg(long, env = "ADSB_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, env = "ADSB_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Negotiate the AWS IoT ALPN protocol (requires certificates)
    #[arg(long, env = "ADSB_AWS_IOT")]
    aws_iot: bool,

    /// dump1090 host
    #[arg(short = 'H', long, env = "ADSB_FEED_HOST")]
    feed_host: Option<String>,

    /// dump1090 SBS-1 port
    #[arg(short = 'P', long, env = "ADSB_FEED_PORT")]
    feed_port: Option<u16>,

    /// Aircraft database host (lookups disabled when unset)
    #[arg(long, env = "ADSB_PLANEDB_HOST")]
    planedb: Option<String>,

    /// Remote log host as host[:port] (UDP)
    #[arg(short = 'l', long, env = "ADSB_LOG_HOST")]
    log_host: Option<String>,

    /// Debug logging
    #[arg(short, long, env = "ADSB_VERBOSE")]
    verbose: bool,
}

impl Cli {
    /// Overlay everything given on the command line onto `config`.
    fn apply(&self, config: &mut Config) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        fn set_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }

        set(&mut config.radar_name, &self.radar_name);
        set(&mut config.mqtt.host, &self.mqtt_host);
        set_opt(&mut config.mqtt.port, &self.mqtt_port);
        set_opt(&mut config.mqtt.username, &self.mqtt_user);
        set_opt(&mut config.mqtt.password, &self.mqtt_password);
        set_opt(&mut config.mqtt.ca_cert, &self.ca_cert);
        set_opt(&mut config.mqtt.client_cert, &self.client_cert);
        set_opt(&mut config.mqtt.client_key, &self.client_key);
        config.mqtt.aws_iot |= self.aws_iot;
        set(&mut config.feed.host, &self.feed_host);
        set(&mut config.feed.port, &self.feed_port);
        set_opt(&mut config.planedb.host, &self.planedb);
        set_opt(&mut config.logging.remote_host, &self.log_host);
        config.logging.verbose |= self.verbose;
    }

    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    logging::init(&config.logging)?;

    let auth = config.validate().context("invalid configuration")?;
    let (bridge, handle) = Bridge::new(&config.mqtt, &auth, &config.timing)?;
    let lookup = PlaneDb::from_config(&config.planedb)?
        .map(|db| Arc::new(db) as Arc<dyn AircraftLookup>);

    info!(
        "Publishing {}:{} to {} on {}",
        config.feed.host,
        config.feed.port,
        config.topic(),
        config.mqtt.host
    );

    let feed = FeedReader::new(&config, handle.clone(), lookup);
    let mut feed_task = tokio::spawn(feed.run());
    let mut bridge_task = tokio::spawn(bridge.run());

    tokio::select! {
        res = &mut feed_task => {
            error!("Feed reader stopped: {res:?}");
            bail!("feed reader stopped");
        }
        res = &mut bridge_task => {
            error!("MQTT bridge stopped: {res:?}");
            bail!("MQTT bridge stopped");
        }
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for Ctrl-C")?;
            info!("Shutting down");
            feed_task.abort();
            handle.disconnect();
            if tokio::time::timeout(SHUTDOWN_GRACE, bridge_task).await.is_err() {
                info!("MQTT disconnect did not complete within {SHUTDOWN_GRACE:?}");
            }
            Ok(())
        }
    }
}
