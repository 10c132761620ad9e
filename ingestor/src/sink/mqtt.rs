use super::Sink;
use async_trait::async_trait;
use ingestor_core::config::{ensure_file, MqttConfig};
use ingestor_core::{Error, Result};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::fmt;
use std::fs;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Username under which a service account token is presented.
pub const SAT_USERNAME: &str = "$sat";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 16;

/// Everything the client presents to the broker, with files already read.
#[derive(PartialEq, Eq)]
pub struct ConnectionPlan {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub tls: Option<TlsMaterial>,
}

#[derive(PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl ConnectionPlan {
    pub fn resolve(config: &MqttConfig) -> Result<Self> {
        // SAT works with or without TLS
        let credentials = match &config.sat_token_path {
            Some(path) => {
                ensure_file(path, "SAT_TOKEN_PATH")?;
                info!("SAT token path is set and will be used for authentication");
                let token = fs::read_to_string(path)?;
                Some((SAT_USERNAME.to_string(), token.trim().to_string()))
            }
            None => None,
        };

        let tls = if config.use_tls {
            let ca_file = config
                .ca_file
                .as_deref()
                .ok_or_else(|| Error::Config("USE_TLS is set but CA_FILE_PATH is not".into()))?;
            ensure_file(ca_file, "CA_FILE_PATH")?;

            let client_auth = match (&config.client_cert_file, &config.client_key_file) {
                (Some(cert), Some(key)) => {
                    ensure_file(cert, "CLIENT_CERT_FILE")?;
                    ensure_file(key, "CLIENT_KEY_FILE")?;
                    info!("Client certificate and key are set and will be used for authentication");
                    Some((fs::read(cert)?, fs::read(key)?))
                }
                _ => None,
            };

            Some(TlsMaterial {
                ca: fs::read(ca_file)?,
                client_auth,
            })
        } else {
            info!("TLS is disabled");
            None
        };

        Ok(Self {
            host: config.host.clone(),
            port: config.port(),
            client_id: config.client_id.clone(),
            credentials,
            tls,
        })
    }

    pub fn into_options(self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id, self.host, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        if let Some((username, password)) = self.credentials {
            options.set_credentials(username, password);
        }

        if let Some(tls) = self.tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: tls.ca,
                alpn: None,
                client_auth: tls.client_auth,
            }));
        }

        options
    }
}

impl fmt::Debug for ConnectionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPlan")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.credentials.as_ref().map(|(user, _)| user))
            .field("tls", &self.tls.is_some())
            .field(
                "client_auth",
                &self.tls.as_ref().is_some_and(|tls| tls.client_auth.is_some()),
            )
            .finish()
    }
}

/// QoS 1 progress reported by the event loop, by packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent(u16),
    Acked(u16),
}

/// Publishes each value to the MQTT topic named by the key and waits for
/// the broker's PUBACK.
pub struct MqttSink {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    /// Also serializes publishes, so one delivery is tracked at a time
    deliveries: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    ack_timeout: Duration,
    stop: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    sink_id: String,
}

impl MqttSink {
    #[instrument(skip(config), fields(host = %config.host))]
    pub async fn connect(config: &MqttConfig) -> Result<Self> {
        let plan = ConnectionPlan::resolve(config)?;
        let sink_id = format!("mqtt://{}:{}", plan.host, plan.port);
        debug!(plan = ?plan, "Connecting to MQTT broker");

        let (client, mut event_loop) = AsyncClient::new(plan.into_options(), REQUEST_CAPACITY);

        match tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connack(&mut event_loop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::sink(&sink_id, format!("failed to connect to MQTT broker: {e}")))
            }
            Err(_) => return Err(Error::sink(&sink_id, "timed out waiting for CONNACK")),
        }

        let (connected_tx, connected) = watch::channel(true);
        let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let handle = tokio::spawn(drive_event_loop(
            event_loop,
            EventLoopLinks {
                sink_id: sink_id.clone(),
                connected: connected_tx,
                deliveries: deliveries_tx,
                stop: stop.clone(),
            },
        ));

        Ok(Self {
            client,
            connected,
            deliveries: Mutex::new(deliveries),
            ack_timeout: ACK_TIMEOUT,
            stop,
            event_loop: Mutex::new(Some(handle)),
            sink_id,
        })
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> std::result::Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = event_loop.poll().await? {
            return Ok(());
        }
    }
}

/// Wait for the PUBACK matching the next publish that goes out.
async fn wait_for_puback(deliveries: &mut mpsc::UnboundedReceiver<Delivery>) -> Option<u16> {
    let mut pkid = None;
    while let Some(delivery) = deliveries.recv().await {
        match delivery {
            Delivery::Sent(id) if pkid.is_none() => pkid = Some(id),
            Delivery::Acked(id) if pkid == Some(id) => return Some(id),
            _ => {}
        }
    }
    None
}

struct EventLoopLinks {
    sink_id: String,
    connected: watch::Sender<bool>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    stop: CancellationToken,
}

async fn drive_event_loop(mut event_loop: EventLoop, links: EventLoopLinks) {
    let sink_id = &links.sink_id;

    loop {
        let event = tokio::select! {
            _ = links.stop.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(sink = %sink_id, "Reconnected to MQTT broker");
                links.connected.send_replace(true);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = links.deliveries.send(Delivery::Sent(pkid));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = links.deliveries.send(Delivery::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Incoming::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if links.connected.send_replace(false) {
                    warn!(sink = %sink_id, error = %e, "MQTT connection lost, reconnecting");
                } else {
                    debug!(sink = %sink_id, error = %e, "MQTT reconnect failed");
                }
                tokio::select! {
                    _ = links.stop.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                }
            }
        }
    }

    links.connected.send_replace(false);
    debug!(sink = %sink_id, "MQTT event loop stopped");
}

#[async_trait]
impl Sink for MqttSink {
    async fn put(&self, key: &str, value: &str) -> Result<bool> {
        let mut deliveries = self.deliveries.lock().await;

        if !self.is_connected() {
            return Err(Error::sink(&self.sink_id, "not connected to the MQTT broker"));
        }

        // Reports left over from publishes that timed out earlier
        while deliveries.try_recv().is_ok() {}

        self.client
            .try_publish(key, QoS::AtLeastOnce, false, value.as_bytes().to_vec())
            .map_err(|e| Error::sink(&self.sink_id, format!("publish to '{key}' not queued: {e}")))?;

        match tokio::time::timeout(self.ack_timeout, wait_for_puback(&mut deliveries)).await {
            Ok(Some(pkid)) => {
                debug!(sink = %self.sink_id, pkid, "PUBACK received");
                Ok(true)
            }
            Ok(None) => Err(Error::sink(&self.sink_id, "MQTT event loop stopped")),
            Err(_) => Err(Error::sink(
                &self.sink_id,
                format!("publish to '{key}' not acknowledged within {:?}", self.ack_timeout),
            )),
        }
    }

    fn sink_id(&self) -> &str {
        &self.sink_id
    }

    async fn close(&self) -> Result<()> {
        let Some(handle) = self.event_loop.lock().await.take() else {
            return Ok(());
        };

        // A DISCONNECT only goes out while connected; otherwise just stop
        let disconnecting = self.is_connected() && self.client.try_disconnect().is_ok();
        if !disconnecting {
            self.stop.cancel();
        }

        let abort = handle.abort_handle();
        if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
            warn!(sink = %self.sink_id, "MQTT event loop did not stop in time, aborting");
            self.stop.cancel();
            abort.abort();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn config() -> MqttConfig {
        MqttConfig {
            host: "aio-broker".into(),
            port: None,
            client_id: "ingestor-test".into(),
            use_tls: false,
            ca_file: None,
            client_cert_file: None,
            client_key_file: None,
            sat_token_path: None,
        }
    }

    fn local(port: u16) -> MqttConfig {
        let mut config = config();
        config.host = "127.0.0.1".into();
        config.port = Some(port);
        config
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Broker {
        /// Answers every QoS 1 publish with a PUBACK
        Acking,
        /// Takes publishes and never acknowledges them
        Silent,
        /// Sends CONNACK, then closes the socket and stops listening
        HangsUp,
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// A single-connection MQTT 3.1.1 broker, just enough for one client.
    async fn spawn_broker(behaviour: Broker) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            if read_packet(&mut stream).await.is_err() {
                return;
            }
            if stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.is_err() {
                return;
            }
            if behaviour == Broker::HangsUp {
                drop(listener);
                return;
            }

            while let Ok((header, body)) = read_packet(&mut stream).await {
                let reply: Option<Vec<u8>> = match header >> 4 {
                    3 if behaviour == Broker::Acking => {
                        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        let pkid = &body[2 + topic_len..4 + topic_len];
                        Some(vec![0x40, 0x02, pkid[0], pkid[1]])
                    }
                    12 => Some(vec![0xd0, 0x00]),
                    14 => break,
                    _ => None,
                };
                if let Some(reply) = reply {
                    if stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            }
        });

        port
    }

    #[test]
    fn plain_connection_plan() {
        let plan = ConnectionPlan::resolve(&config()).unwrap();

        assert_eq!(plan.port, 1883);
        assert_eq!(plan.client_id, "ingestor-test");
        assert!(plan.credentials.is_none());
        assert!(plan.tls.is_none());
    }

    #[test]
    fn sat_token_becomes_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let token = dir.path().join("mqtt-client-token");
        fs::write(&token, "eyJhbGciOi.token\n").unwrap();

        let mut config = config();
        config.sat_token_path = Some(token);
        let plan = ConnectionPlan::resolve(&config).unwrap();

        assert_eq!(
            plan.credentials,
            Some(("$sat".to_string(), "eyJhbGciOi.token".to_string()))
        );
        assert!(!format!("{plan:?}").contains("eyJhbGciOi"));
    }

    #[test]
    fn tls_plan_reads_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        let cert = dir.path().join("client.pem");
        let key = dir.path().join("client.key");
        fs::write(&ca, "CA").unwrap();
        fs::write(&cert, "CERT").unwrap();
        fs::write(&key, "KEY").unwrap();

        let mut config = config();
        config.use_tls = true;
        config.ca_file = Some(ca);
        config.client_cert_file = Some(cert);
        config.client_key_file = Some(key);
        let plan = ConnectionPlan::resolve(&config).unwrap();

        assert_eq!(plan.port, 8883);
        let tls = plan.tls.unwrap();
        assert_eq!(tls.ca, b"CA".to_vec());
        assert_eq!(tls.client_auth, Some((b"CERT".to_vec(), b"KEY".to_vec())));
    }

    #[test]
    fn missing_certificate_file_is_a_configuration_error() {
        let mut config = config();
        config.use_tls = true;
        config.ca_file = Some(PathBuf::from("/no/such/ca.pem"));

        let err = ConnectionPlan::resolve(&config).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("CA_FILE_PATH"));
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_sink_error() {
        let err = MqttSink::connect(&local(1)).await.err().unwrap();
        assert_eq!(err.category(), "sink");
    }

    #[tokio::test]
    async fn put_succeeds_once_the_broker_acknowledges() {
        let port = spawn_broker(Broker::Acking).await;
        let sink = MqttSink::connect(&local(port)).await.unwrap();

        assert!(sink.put("quality", "country: uk").await.unwrap());
        assert!(sink.put("quality", "country: fr").await.unwrap());

        let closed = tokio::time::timeout(Duration::from_secs(10), sink.close()).await;
        assert!(matches!(closed, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn unacknowledged_publish_is_a_sink_error() {
        let port = spawn_broker(Broker::Silent).await;
        let mut sink = MqttSink::connect(&local(port)).await.unwrap();
        sink.ack_timeout = Duration::from_millis(200);

        let err = sink.put("quality", "country: uk").await.unwrap_err();
        assert_eq!(err.category(), "sink");
        assert!(err.to_string().contains("not acknowledged"));
    }

    #[tokio::test]
    async fn broker_going_away_fails_puts_without_blocking() {
        let port = spawn_broker(Broker::HangsUp).await;
        let mut sink = MqttSink::connect(&local(port)).await.unwrap();
        sink.ack_timeout = Duration::from_millis(500);

        for attempt in 0..25 {
            let put = tokio::time::timeout(Duration::from_secs(2), sink.put("quality", "country: uk"))
                .await
                .unwrap_or_else(|_| panic!("put {attempt} blocked with the broker down"));
            assert!(put.is_err(), "put {attempt} reported success with the broker down");
        }

        let closed = tokio::time::timeout(Duration::from_secs(10), sink.close()).await;
        assert!(closed.is_ok(), "close blocked with the broker down");
    }
}
