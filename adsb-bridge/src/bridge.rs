//! MQTT bridge: one logical session with the broker, kept alive forever.
//!
//! The session is split the way `rumqttc` splits it:
//!
//! - [`BridgeHandle`] wraps the cloneable `AsyncClient`. Publishing only
//!   enqueues; a full queue or a dead session drops the message (QoS 0).
//! - [`Bridge`] owns the event loop and a [`Link`] state machine. It must be
//!   driven by [`Bridge::run_event_loop`] on its own task.
//!
//! Link states:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> Connecting ...
//!                                   \-> Closed   (local disconnect, final)
//! ```
//!
//! An unexpected disconnection (transport error or broker-initiated
//! DISCONNECT) moves the link straight back to Connecting from the event
//! handler. A disconnect requested through [`BridgeHandle::disconnect`]
//! closes the link and the event loop returns.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration, Transport,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use adsb_core::config::{MqttAuth, MqttConfig, TimingConfig, IOT_ALPN_PROTOCOL};

use crate::error::{Error, Result};

/// Outgoing requests buffered by the client before publishes are dropped.
pub const REQUEST_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Something aircraft documents can be handed to.
pub trait Publisher: Send + Sync {
    /// Accept `payload` for sending on `topic`. Never fails from the
    /// caller's point of view.
    fn publish(&self, topic: &str, payload: String);
}

/// Cloneable, thread-safe handle to the bridge session.
#[derive(Clone)]
pub struct BridgeHandle {
    client: AsyncClient,
    disconnect_requested: Arc<AtomicBool>,
}

impl BridgeHandle {
    pub fn publish_with(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) {
        if let Err(e) = self.client.try_publish(topic, qos, retain, payload) {
            debug!(topic, "MQTT publish dropped: {e}");
        }
    }

    /// Close the session on purpose. The event loop will not reconnect.
    pub fn disconnect(&self) {
        info!("Disconnecting from MQTT broker");
        self.disconnect_requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request dropped: {e}");
        }
    }
}

impl Publisher for BridgeHandle {
    fn publish(&self, topic: &str, payload: String) {
        self.publish_with(topic, payload, QoS::AtMostOnce, false);
    }
}

// ---------------------------------------------------------------------------
// Link state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// We sent DISCONNECT ourselves.
    Requested,
    /// The broker sent DISCONNECT.
    Broker,
    /// Transport or protocol failure.
    Error(String),
}

#[derive(Debug)]
pub struct Link {
    state: LinkState,
    disconnect_requested: Arc<AtomicBool>,
    retry_elapsed: Duration,
    reconnects: u64,
}

impl Link {
    pub fn new(disconnect_requested: Arc<AtomicBool>) -> Self {
        Link {
            state: LinkState::Disconnected,
            disconnect_requested,
            retry_elapsed: Duration::ZERO,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Time spent retrying in the current connection attempt sequence.
    pub fn retry_elapsed(&self) -> Duration {
        self.retry_elapsed
    }

    /// Reconnection sequences started after unexpected disconnections.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::SeqCst)
    }

    pub fn begin_connect(&mut self) {
        self.state = LinkState::Connecting;
    }

    pub fn connect_failed(&mut self, waited: Duration) {
        self.retry_elapsed += waited;
    }

    pub fn connected(&mut self) {
        self.state = LinkState::Connected;
        self.retry_elapsed = Duration::ZERO;
    }

    /// Record the end of a session. Returns true when a reconnection
    /// sequence must start.
    pub fn disconnected(&mut self, cause: &DisconnectCause) -> bool {
        if *cause == DisconnectCause::Requested || self.disconnect_requested() {
            self.state = LinkState::Closed;
            return false;
        }
        self.state = LinkState::Disconnected;
        self.reconnects += 1;
        true
    }
}

// ---------------------------------------------------------------------------
// Session transport
// ---------------------------------------------------------------------------

/// Source of MQTT events; `rumqttc::EventLoop` in production.
#[async_trait]
pub trait Session: Send {
    async fn poll(&mut self) -> std::result::Result<Event, ConnectionError>;
}

#[async_trait]
impl Session for EventLoop {
    async fn poll(&mut self) -> std::result::Result<Event, ConnectionError> {
        EventLoop::poll(self).await
    }
}

/// Build client options for the configured authentication mode.
pub fn mqtt_options(config: &MqttConfig, auth: &MqttAuth, client_id: &str) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(client_id, &config.host, config.effective_port());
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);

    match auth {
        MqttAuth::Anonymous => {}
        MqttAuth::Credentials { username, password } => {
            options.set_credentials(username, password);
        }
        MqttAuth::Certificates {
            ca_cert,
            client_cert,
            client_key,
            alpn,
        } => {
            options.set_transport(tls_transport(ca_cert, client_cert, client_key, *alpn)?);
        }
    }

    Ok(options)
}

/// TLS transport verifying the broker against `ca_cert` and authenticating
/// with the client certificate chain (mutual TLS).
pub fn tls_transport(ca_cert: &Path, client_cert: &Path, client_key: &Path, alpn: bool) -> Result<Transport> {
    let ca = read_pem(ca_cert)?;
    let cert = read_pem(client_cert)?;
    let key = read_pem(client_key)?;

    Ok(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: alpn.then(|| vec![IOT_ALPN_PROTOCOL.as_bytes().to_vec()]),
        client_auth: Some((cert, key)),
    }))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Certificate {
        path: path.to_path_buf(),
        source: e,
    })
}

fn client_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

pub struct Bridge<S = EventLoop> {
    session: S,
    link: Link,
    retry_delay: Duration,
    poll_interval: Duration,
}

impl Bridge<EventLoop> {
    /// Create the session and its publish handle. Nothing connects until
    /// [`Bridge::connect`] or [`Bridge::run`] is awaited.
    pub fn new(config: &MqttConfig, auth: &MqttAuth, timing: &TimingConfig) -> Result<(Self, BridgeHandle)> {
        let client_id = client_id(&config.client_id_prefix);
        let options = mqtt_options(config, auth, &client_id)?;
        if config.ignores_certificates() {
            warn!("MQTT credentials given, the configured certificates are not used");
        }
        info!(
            "MQTT client {} for {}:{}",
            client_id,
            config.host,
            config.effective_port()
        );

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let disconnect_requested = Arc::new(AtomicBool::new(false));
        let handle = BridgeHandle {
            client,
            disconnect_requested: Arc::clone(&disconnect_requested),
        };
        Ok((
            Bridge::with_session(eventloop, disconnect_requested, timing),
            handle,
        ))
    }
}

impl<S: Session> Bridge<S> {
    pub fn with_session(session: S, disconnect_requested: Arc<AtomicBool>, timing: &TimingConfig) -> Self {
        Bridge {
            session,
            link: Link::new(disconnect_requested),
            retry_delay: timing.mqtt_retry(),
            poll_interval: timing.mqtt_poll_interval(),
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Connect and service the session until it is closed on request.
    pub async fn run(mut self) {
        self.connect().await;
        self.run_event_loop().await;
    }

    /// Retry until the broker acknowledges the connection, with a fixed
    /// delay between attempts.
    pub async fn connect(&mut self) {
        self.link.begin_connect();
        let mut attempts = 0u32;

        loop {
            if self.link.disconnect_requested() {
                self.link.disconnected(&DisconnectCause::Requested);
                return;
            }

            match self.session.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                    info!(
                        "MQTT connected after {} failed attempts ({:.1}s retrying)",
                        attempts,
                        self.link.retry_elapsed().as_secs_f64()
                    );
                    self.link.connected();
                    return;
                }
                Ok(event) => debug!("MQTT event while connecting: {event:?}"),
                Err(e) => {
                    attempts += 1;
                    if attempts == 1 {
                        warn!("MQTT connection failed: {e}, retrying every {:?}", self.retry_delay);
                    } else {
                        debug!(attempts, "MQTT connection failed: {e}");
                    }
                    tokio::time::sleep(self.retry_delay).await;
                    self.link.connect_failed(self.retry_delay);
                }
            }
        }
    }

    /// Service the session (acks, pings, disconnects) forever. Returns only
    /// after a requested disconnect.
    pub async fn run_event_loop(&mut self) {
        while self.service().await {}
        info!("MQTT event loop stopped");
    }

    /// One poll of the session, bounded by the poll interval. Returns false
    /// once the link is closed.
    pub async fn service(&mut self) -> bool {
        if self.link.state() == LinkState::Closed {
            return false;
        }

        let event = match tokio::time::timeout(self.poll_interval, self.session.poll()).await {
            Ok(event) => event,
            Err(_) => return true,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    self.link.connected();
                }
                debug!("MQTT connack: {:?}", ack.code);
            }
            Ok(Event::Incoming(Packet::PingResp)) => debug!("MQTT ping response"),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                self.handle_disconnect(DisconnectCause::Broker).await
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                self.handle_disconnect(DisconnectCause::Requested).await
            }
            Ok(_) => {}
            Err(e) => {
                self.handle_disconnect(DisconnectCause::Error(e.to_string()))
                    .await
            }
        }

        self.link.state() != LinkState::Closed
    }

    async fn handle_disconnect(&mut self, cause: DisconnectCause) {
        if !self.link.disconnected(&cause) {
            info!("MQTT session closed");
            return;
        }

        match &cause {
            DisconnectCause::Error(e) => warn!("Unexpected MQTT disconnection: {e}, reconnecting"),
            _ => warn!("MQTT broker closed the session, reconnecting"),
        }
        self.connect().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::ErrorKind;

    use rumqttc::ConnAck;

    type Step = std::result::Result<Event, ConnectionError>;

    /// Replays a fixed sequence of events, then idles forever.
    struct ScriptedSession {
        script: VecDeque<Step>,
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn poll(&mut self) -> Step {
            match self.script.pop_front() {
                Some(step) => step,
                None => std::future::pending().await,
            }
        }
    }

    fn connack() -> Step {
        Ok(Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        })))
    }

    fn reset() -> Step {
        Err(ConnectionError::Io(std::io::Error::new(
            ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }

    fn bridge(script: Vec<Step>) -> (Bridge<ScriptedSession>, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let session = ScriptedSession {
            script: script.into(),
        };
        let bridge = Bridge::with_session(session, Arc::clone(&flag), &TimingConfig::default());
        (bridge, flag)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_fixed_delay() {
        let (mut bridge, _) = bridge(vec![reset(), reset(), connack()]);
        let start = tokio::time::Instant::now();

        bridge.connect().await;

        assert_eq!(bridge.link().state(), LinkState::Connected);
        assert_eq!(bridge.link().retry_elapsed(), Duration::ZERO);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(bridge.link().reconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_disconnect_reconnects_once() {
        let (mut bridge, _) = bridge(vec![connack(), reset(), reset(), connack()]);
        bridge.connect().await;

        assert!(bridge.service().await);
        assert_eq!(bridge.link().state(), LinkState::Connected);
        assert_eq!(bridge.link().reconnects(), 1);
        assert!(bridge.session.script.is_empty());

        // Idle poll: nothing else happens
        assert!(bridge.service().await);
        assert_eq!(bridge.link().reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_disconnect_reconnects() {
        let (mut bridge, _) = bridge(vec![
            connack(),
            Ok(Event::Incoming(Packet::Disconnect)),
            connack(),
        ]);
        bridge.connect().await;

        assert!(bridge.service().await);
        assert_eq!(bridge.link().state(), LinkState::Connected);
        assert_eq!(bridge.link().reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_does_not_reconnect() {
        let (mut bridge, flag) = bridge(vec![
            connack(),
            Ok(Event::Outgoing(Outgoing::Disconnect)),
            connack(),
        ]);
        bridge.connect().await;
        flag.store(true, Ordering::SeqCst);

        assert!(!bridge.service().await);
        assert_eq!(bridge.link().state(), LinkState::Closed);
        assert_eq!(bridge.link().reconnects(), 0);
        assert_eq!(bridge.session.script.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_requested_disconnect_closes() {
        let (mut bridge, flag) = bridge(vec![connack(), reset(), connack()]);
        bridge.connect().await;
        flag.store(true, Ordering::SeqCst);

        bridge.run_event_loop().await;
        assert_eq!(bridge.link().state(), LinkState::Closed);
        assert_eq!(bridge.link().reconnects(), 0);
        assert_eq!(bridge.session.script.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_poll_is_bounded() {
        let (mut bridge, _) = bridge(vec![connack()]);
        bridge.connect().await;
        let start = tokio::time::Instant::now();
        assert!(bridge.service().await);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn test_link_transitions() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut link = Link::new(Arc::clone(&flag));
        assert_eq!(link.state(), LinkState::Disconnected);

        link.begin_connect();
        link.connect_failed(Duration::from_secs(2));
        link.connect_failed(Duration::from_secs(2));
        assert_eq!(link.retry_elapsed(), Duration::from_secs(4));
        link.connected();
        assert_eq!(link.retry_elapsed(), Duration::ZERO);

        assert!(link.disconnected(&DisconnectCause::Error("timeout".into())));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.reconnects(), 1);

        assert!(!link.disconnected(&DisconnectCause::Requested));
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(link.reconnects(), 1);
    }

    #[test]
    fn test_link_flag_suppresses_reconnect() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut link = Link::new(flag);
        assert!(!link.disconnected(&DisconnectCause::Broker));
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_publish_drops_silently_when_queue_full() {
        let options = MqttOptions::new("test-client", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 2);
        let handle = BridgeHandle {
            client,
            disconnect_requested: Arc::new(AtomicBool::new(false)),
        };

        for i in 0..10 {
            handle.publish("/adsb/test/json", format!("{{\"n\":{i}}}"));
        }
        handle.disconnect();
        assert!(handle.disconnect_requested.load(Ordering::SeqCst));
    }

    #[test]
    fn test_tls_transport_with_alpn() {
        let dir = tempfile::tempdir().unwrap();
        let [ca, cert, key] = ["ca.pem", "client.pem", "client.key"].map(|name| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("{name} contents")).unwrap();
            path
        });

        match tls_transport(&ca, &cert, &key, true).unwrap() {
            Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn,
                client_auth,
            }) => {
                assert_eq!(ca, b"ca.pem contents".to_vec());
                assert_eq!(alpn, Some(vec![b"x-amzn-mqtt-ca".to_vec()]));
                let (cert, key) = client_auth.unwrap();
                assert_eq!(cert, b"client.pem contents".to_vec());
                assert_eq!(key, b"client.key contents".to_vec());
            }
            _ => panic!("expected simple TLS transport"),
        }

        match tls_transport(&ca, &cert, &key, false).unwrap() {
            Transport::Tls(TlsConfiguration::Simple { alpn, .. }) => assert!(alpn.is_none()),
            _ => panic!("expected simple TLS transport"),
        }
    }

    #[test]
    fn test_tls_transport_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("ca.pem");
        let Err(err) = tls_transport(&missing, &missing, &missing, false) else {
            panic!("missing certificate must fail");
        };
        assert!(matches!(err, Error::Certificate { .. }));
    }

    #[test]
    fn test_mqtt_options_port_and_keepalive() {
        let config = MqttConfig {
            host: "broker.local".into(),
            ..Default::default()
        };
        let auth = MqttAuth::Credentials {
            username: "adsb".into(),
            password: "secret".into(),
        };
        let options = mqtt_options(&config, &auth, "adsbclient-1").unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert_eq!(options.client_id(), "adsbclient-1");
    }

    #[test]
    fn test_client_id_prefix() {
        let id = client_id("adsbclient");
        assert!(id.starts_with("adsbclient-"));
        assert_eq!(id.len(), "adsbclient-".len() + 8);
    }
}
