//! Logging setup.
//!
//! Console output always; optionally every event is also sent as one UDP
//! datagram to a remote log collector (syslog-style, default port 514).
//! `RUST_LOG` overrides the level chosen by the verbose flag.

use std::io;
use std::net::UdpSocket;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use adsb_core::config::LoggingConfig;

use crate::error::{Error, Result};

pub const DEFAULT_REMOTE_PORT: u16 = 514;

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = if config.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);

    let remote_layer = match &config.remote_host {
        Some(spec) => {
            let (host, port) = parse_remote_host(spec)?;
            let writer = RemoteWriter::connect(&host, port)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(move || writer.clone()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(remote_layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

/// Split `host[:port]`.
pub fn parse_remote_host(spec: &str) -> Result<(String, u16)> {
    let spec = spec.trim();
    let invalid = || Error::RemoteLogHost(spec.to_string());

    let (host, port) = match spec.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (spec, DEFAULT_REMOTE_PORT),
    };
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Writes each formatted event as a single datagram.
#[derive(Clone)]
struct RemoteWriter {
    socket: Arc<UdpSocket>,
}

impl RemoteWriter {
    fn connect(host: &str, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .and_then(|s| s.connect((host, port)).map(|_| s))
            .map_err(|e| Error::Logging(format!("remote log host {host}:{port}: {e}")))?;
        Ok(RemoteWriter {
            socket: Arc::new(socket),
        })
    }
}

impl io::Write for RemoteWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Delivery is best effort; a missing collector must not stall logging
        let _ = self.socket.send(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
