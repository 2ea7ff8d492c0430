//! MQTT transport for [`BrokerClient`].
//!
//! Mailbox and stream traffic are mapped onto topics, with subject and sender
//! encoded as the last two levels:
//!
//! ```text
//! malamute/mailbox/<recipient>/<subject>/<sender>
//! malamute/stream/<stream>/<subject>/<sender>
//! ```
//!
//! MQTT has no subject filtering beyond wildcards, so consumers subscribe to
//! the whole stream and subject patterns are applied on receive.
//!
//! The event loop task never waits on the actor: an actor that consumes its
//! own producer stream publishes while its incoming queue fills up. A lost
//! connection ends the task, `recv` then yields `None` and the actor has to
//! START again, which redeclares every subscription.

use super::{compile_pattern, BrokerClient, BrokerError, Delivery, DeliveryKind};
use async_trait::async_trait;
use regex::Regex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TOPIC_ROOT: &str = "malamute";
const DEFAULT_PORT: u16 = 1883;
const KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Raw publish as seen by the event loop task
type RawPublish = (String, Vec<u8>);

pub struct MqttBroker {
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
    address: Option<String>,
    producer: Option<String>,
    consumers: Vec<(String, Regex)>,
    incoming: Option<mpsc::UnboundedReceiver<RawPublish>>,
}

impl Default for MqttBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttBroker {
    pub fn new() -> Self {
        Self {
            client: None,
            poller: None,
            address: None,
            producer: None,
            consumers: Vec::new(),
            incoming: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, BrokerError> {
        self.client.as_ref().ok_or(BrokerError::NotConnected)
    }

    fn sender(&self) -> Result<&str, BrokerError> {
        self.address.as_deref().ok_or(BrokerError::NotConnected)
    }

    fn teardown(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not delivered: {}", e);
            }
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.incoming = None;
        self.consumers.clear();
        self.producer = None;
        self.address = None;
    }

    /// Turns a raw publish into a delivery, `None` when it is filtered out.
    fn route(&self, topic: &str, payload: Vec<u8>) -> Option<Delivery> {
        let (kind, subject, sender) = parse_topic(topic)?;

        if let DeliveryKind::Stream { stream } = &kind {
            let accepted = self
                .consumers
                .iter()
                .any(|(name, pattern)| name == stream && pattern.is_match(&subject));
            if !accepted {
                debug!("Filtered {} on stream {}", subject, stream);
                return None;
            }
        }

        Some(Delivery {
            kind,
            sender,
            subject,
            payload,
        })
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn connect(
        &mut self,
        endpoint: &str,
        timeout: Duration,
        address: &str,
    ) -> Result<(), BrokerError> {
        validate_name(address)?;
        let (host, port) = parse_endpoint(endpoint)?;

        // Reconnecting starts from a clean session
        self.teardown();

        let mut options = MqttOptions::new(address, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, eventloop) = AsyncClient::new(options, 100);

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (connack_tx, connack_rx) = oneshot::channel();
        let poller = tokio::spawn(poll_events(eventloop, incoming_tx, connack_tx));

        let connected = match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(BrokerError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(BrokerError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "event loop stopped".to_string(),
            }),
            Err(_) => Err(BrokerError::Timeout(endpoint.to_string())),
        };
        if let Err(e) = connected {
            poller.abort();
            return Err(e);
        }

        client
            .subscribe(mailbox_filter(address), QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        self.client = Some(client);
        self.poller = Some(poller);
        self.incoming = Some(incoming_rx);
        self.address = Some(address.to_string());

        info!("Connected to {} as {}", endpoint, address);
        Ok(())
    }

    async fn set_producer(&mut self, stream: &str) -> Result<(), BrokerError> {
        self.client()?;
        validate_name(stream)?;
        self.producer = Some(stream.to_string());
        Ok(())
    }

    async fn set_consumer(&mut self, stream: &str, pattern: &str) -> Result<(), BrokerError> {
        validate_name(stream)?;
        let compiled = compile_pattern(pattern)?;

        self.client()?
            .subscribe(stream_filter(stream), QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        debug!("Consuming {} with pattern {}", stream, pattern);
        self.consumers.push((stream.to_string(), compiled));
        Ok(())
    }

    async fn send(&mut self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        validate_name(subject)?;
        let stream = self.producer.as_deref().ok_or(BrokerError::NoProducer)?;
        let topic = stream_topic(stream, subject, self.sender()?);

        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn sendto(
        &mut self,
        address: &str,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        validate_name(address)?;
        validate_name(subject)?;
        let topic = mailbox_topic(address, subject, self.sender()?);

        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let (topic, payload) = self.incoming.as_mut()?.recv().await?;
            if let Some(delivery) = self.route(&topic, payload) {
                return Some(delivery);
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.as_ref() {
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect request not delivered: {}", e);
            }
        }
        self.teardown();
    }

    fn producer(&self) -> Option<&str> {
        self.producer.as_deref()
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Drives the rumqttc event loop, forwarding publishes until the receiver is
/// gone or the connection fails.
async fn poll_events(
    mut eventloop: EventLoop,
    incoming: mpsc::UnboundedSender<RawPublish>,
    connack: oneshot::Sender<Result<(), String>>,
) {
    let mut connack = Some(connack);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("Broker acknowledged connection: {:?}", ack.code);
                if let Some(tx) = connack.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if incoming
                    .send((publish.topic, publish.payload.to_vec()))
                    .is_err()
                {
                    debug!("Receiver dropped, stopping event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                // Before the first CONNACK an error means the connect failed
                match connack.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e.to_string()));
                    }
                    None => warn!("MQTT connection lost: {}", e),
                }
                break;
            }
        }
    }
    debug!("MQTT event loop stopped");
}

/// Accepts `tcp://host:port`, `mqtt://host:port` and `host[:port]`.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), BrokerError> {
    let invalid = || BrokerError::InvalidEndpoint(endpoint.to_string());

    let address = endpoint
        .strip_prefix("tcp://")
        .or_else(|| endpoint.strip_prefix("mqtt://"))
        .unwrap_or(endpoint);
    if address.is_empty() || address.contains("://") {
        return Err(invalid());
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(invalid()),
        None => Ok((address.to_string(), DEFAULT_PORT)),
    }
}

/// Names become topic levels and must not contain separators or wildcards.
fn validate_name(name: &str) -> Result<(), BrokerError> {
    if name.is_empty() || name.contains(|c| matches!(c, '/' | '+' | '#')) {
        return Err(BrokerError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn mailbox_topic(recipient: &str, subject: &str, sender: &str) -> String {
    format!("{}/mailbox/{}/{}/{}", TOPIC_ROOT, recipient, subject, sender)
}

fn stream_topic(stream: &str, subject: &str, sender: &str) -> String {
    format!("{}/stream/{}/{}/{}", TOPIC_ROOT, stream, subject, sender)
}

fn mailbox_filter(address: &str) -> String {
    format!("{}/mailbox/{}/+/+", TOPIC_ROOT, address)
}

fn stream_filter(stream: &str) -> String {
    format!("{}/stream/{}/+/+", TOPIC_ROOT, stream)
}

fn parse_topic(topic: &str) -> Option<(DeliveryKind, String, String)> {
    let levels: Vec<&str> = topic.split('/').collect();
    match levels.as_slice() {
        [TOPIC_ROOT, "mailbox", _, subject, sender] => Some((
            DeliveryKind::Mailbox,
            subject.to_string(),
            sender.to_string(),
        )),
        [TOPIC_ROOT, "stream", stream, subject, sender] => Some((
            DeliveryKind::Stream {
                stream: stream.to_string(),
            },
            subject.to_string(),
            sender.to_string(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const WAIT: Duration = Duration::from_secs(15);

    /// Embedded rumqttd listening on a free local port.
    fn embedded_broker() -> u16 {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config: rumqttd::Config = toml::from_str(&format!(
            r#"
id = 0

[router]
max_connections = 16
max_outgoing_packet_count = 200
max_segment_size = 10485760
max_segment_count = 10

[v4.1]
name = "v4-1"
listen = "127.0.0.1:{port}"
next_connection_delay_ms = 1

[v4.1.connections]
connection_timeout_ms = 60000
max_payload_size = 20480
max_inflight_count = 100
dynamic_filters = true
"#
        ))
        .unwrap();

        std::thread::spawn(move || {
            let mut broker = rumqttd::Broker::new(config);
            let _ = broker.start();
        });
        port
    }

    async fn connect_when_ready(broker: &mut MqttBroker, endpoint: &str, address: &str) {
        for _ in 0..50 {
            if broker
                .connect(endpoint, Duration::from_secs(1), address)
                .await
                .is_ok()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("embedded broker at {} did not come up", endpoint);
    }

    #[test]
    fn endpoint_forms() {
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:9999").unwrap(),
            ("127.0.0.1".to_string(), 9999)
        );
        assert_eq!(
            parse_endpoint("broker.local").unwrap(),
            ("broker.local".to_string(), DEFAULT_PORT)
        );
        assert!(parse_endpoint("ipc://@/malamute").is_err());
        assert!(parse_endpoint("tcp://host:port").is_err());
        assert!(parse_endpoint(":1883").is_err());
        assert!(parse_endpoint("").is_err());
    }

    #[test]
    fn topics_round_trip_through_parser() {
        let (kind, subject, sender) =
            parse_topic(&mailbox_topic("it.zmon.device", "GET-ALL", "writer")).unwrap();
        assert_eq!(kind, DeliveryKind::Mailbox);
        assert_eq!(subject, "GET-ALL");
        assert_eq!(sender, "writer");

        let (kind, subject, _) =
            parse_topic(&stream_topic("zmon.device", "INSERT", "it.zmon.device")).unwrap();
        assert_eq!(
            kind,
            DeliveryKind::Stream {
                stream: "zmon.device".to_string()
            }
        );
        assert_eq!(subject, "INSERT");

        assert!(parse_topic("other/topic").is_none());
    }

    #[test]
    fn names_with_topic_separators_are_rejected() {
        assert!(validate_name("it.zmon.device").is_ok());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("#").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn route_filters_streams_by_pattern() {
        let mut broker = MqttBroker::new();
        broker
            .consumers
            .push(("zmon.device".to_string(), compile_pattern("INSERT").unwrap()));

        assert!(broker
            .route("malamute/stream/zmon.device/INSERT/peer", Vec::new())
            .is_some());
        assert!(broker
            .route("malamute/stream/zmon.device/DELETE/peer", Vec::new())
            .is_none());
        assert!(broker
            .route("malamute/stream/zmon.other/INSERT/peer", Vec::new())
            .is_none());
        assert!(broker
            .route("malamute/mailbox/me/LOOKUP/peer", Vec::new())
            .is_some());
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let mut broker = MqttBroker::new();

        assert!(matches!(
            broker.set_producer("zmon.device").await,
            Err(BrokerError::NotConnected)
        ));
        assert!(matches!(
            broker.sendto("peer", "LOOKUP", Vec::new()).await,
            Err(BrokerError::NotConnected)
        ));
        assert!(broker.recv().await.is_none());
    }

    #[tokio::test]
    async fn self_consuming_producer_keeps_publishing() {
        let endpoint = format!("tcp://127.0.0.1:{}", embedded_broker());
        let mut broker = MqttBroker::new();
        connect_when_ready(&mut broker, &endpoint, "it.zmon.device").await;
        broker.set_producer("zmon.device").await.unwrap();
        broker.set_consumer("zmon.device", ".*").await.unwrap();

        // nothing is received while publishing, like the actor inside PUBLISH-ALL
        let payload = br#"{"id":"OK"}"#.to_vec();
        tokio::time::timeout(WAIT, async {
            for _ in 0..500 {
                broker.send("PUBLISH-ALL", payload.clone()).await.unwrap();
            }
        })
        .await
        .expect("publishing stalled");

        for _ in 0..500 {
            let delivery = tokio::time::timeout(WAIT, broker.recv())
                .await
                .expect("deliveries stopped")
                .expect("connection closed");
            assert_eq!(delivery.subject, "PUBLISH-ALL");
            assert_eq!(delivery.sender, "it.zmon.device");
        }

        broker.disconnect().await;
    }

    #[tokio::test]
    async fn lost_connection_ends_deliveries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // CONNACK: no session present, connection accepted
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut broker = MqttBroker::new();
        broker
            .connect(
                &format!("127.0.0.1:{}", port),
                Duration::from_secs(2),
                "it.zmon.device",
            )
            .await
            .unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), broker.recv())
            .await
            .expect("recv kept waiting on a dead connection");
        assert!(next.is_none());
    }
}
