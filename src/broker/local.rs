//! In-process broker.
//!
//! A [`LocalBroker`] is a cheap, cloneable hub. Every [`LocalClient`] opened from
//! it registers its mailbox on connect and its stream subscriptions on
//! `set_consumer`; both are removed again on disconnect or drop.

use super::{compile_pattern, BrokerClient, BrokerError, Delivery, DeliveryKind};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Default)]
struct Hub {
    mailboxes: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    subscriptions: Vec<Subscription>,
}

struct Subscription {
    stream: String,
    pattern: Regex,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Clone, Default)]
pub struct LocalBroker {
    hub: Arc<Mutex<Hub>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> LocalClient {
        let (tx, rx) = mpsc::unbounded_channel();
        LocalClient {
            broker: self.clone(),
            address: None,
            producer: None,
            tx,
            rx,
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        // Hub operations never panic while holding the lock
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct LocalClient {
    broker: LocalBroker,
    address: Option<String>,
    producer: Option<String>,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl LocalClient {
    fn address(&self) -> Result<&str, BrokerError> {
        self.address.as_deref().ok_or(BrokerError::NotConnected)
    }

    fn unregister(&mut self) {
        let mut hub = self.broker.hub();
        hub.mailboxes.retain(|_, tx| !tx.same_channel(&self.tx));
        hub.subscriptions.retain(|sub| !sub.tx.same_channel(&self.tx));
    }
}

#[async_trait]
impl BrokerClient for LocalClient {
    async fn connect(
        &mut self,
        endpoint: &str,
        _timeout: Duration,
        address: &str,
    ) -> Result<(), BrokerError> {
        if endpoint.is_empty() {
            return Err(BrokerError::InvalidEndpoint(endpoint.to_string()));
        }
        if address.is_empty() {
            return Err(BrokerError::InvalidName(address.to_string()));
        }

        self.unregister();
        self.broker
            .hub()
            .mailboxes
            .insert(address.to_string(), self.tx.clone());
        self.address = Some(address.to_string());
        debug!("Local client {} connected to {}", address, endpoint);
        Ok(())
    }

    async fn set_producer(&mut self, stream: &str) -> Result<(), BrokerError> {
        self.address()?;
        self.producer = Some(stream.to_string());
        Ok(())
    }

    async fn set_consumer(&mut self, stream: &str, pattern: &str) -> Result<(), BrokerError> {
        self.address()?;
        let pattern = compile_pattern(pattern)?;
        self.broker.hub().subscriptions.push(Subscription {
            stream: stream.to_string(),
            pattern,
            tx: self.tx.clone(),
        });
        Ok(())
    }

    async fn send(&mut self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let sender = self.address()?.to_string();
        let stream = self.producer.clone().ok_or(BrokerError::NoProducer)?;

        let hub = self.broker.hub();
        for sub in hub
            .subscriptions
            .iter()
            .filter(|sub| sub.stream == stream && sub.pattern.is_match(subject))
        {
            let delivery = Delivery {
                kind: DeliveryKind::Stream {
                    stream: stream.clone(),
                },
                sender: sender.clone(),
                subject: subject.to_string(),
                payload: payload.clone(),
            };
            if sub.tx.send(delivery).is_err() {
                warn!("Dropping {} for a closed subscriber of {}", subject, stream);
            }
        }
        Ok(())
    }

    async fn sendto(
        &mut self,
        address: &str,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let sender = self.address()?.to_string();
        let hub = self.broker.hub();
        let mailbox = hub
            .mailboxes
            .get(address)
            .ok_or_else(|| BrokerError::UnknownAddress(address.to_string()))?;

        mailbox
            .send(Delivery {
                kind: DeliveryKind::Mailbox,
                sender,
                subject: subject.to_string(),
                payload,
            })
            .map_err(|_| BrokerError::UnknownAddress(address.to_string()))
    }

    async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    async fn disconnect(&mut self) {
        self.unregister();
        self.address = None;
        self.producer = None;
    }

    fn producer(&self) -> Option<&str> {
        self.producer.as_deref()
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str = "inproc://local-test";
    const TIMEOUT: Duration = Duration::from_millis(100);

    async fn connected(broker: &LocalBroker, address: &str) -> LocalClient {
        let mut client = broker.client();
        client.connect(ENDPOINT, TIMEOUT, address).await.unwrap();
        client
    }

    #[tokio::test]
    async fn mailbox_delivery_carries_sender_and_subject() {
        let broker = LocalBroker::new();
        let mut alice = connected(&broker, "alice").await;
        let mut bob = connected(&broker, "bob").await;

        alice.sendto("bob", "LOOKUP", b"hi".to_vec()).await.unwrap();
        let delivery = bob.recv().await.unwrap();

        assert_eq!(delivery.kind, DeliveryKind::Mailbox);
        assert_eq!(delivery.sender, "alice");
        assert_eq!(delivery.subject, "LOOKUP");
        assert_eq!(delivery.payload, b"hi");
    }

    #[tokio::test]
    async fn stream_respects_subject_pattern() {
        let broker = LocalBroker::new();
        let mut producer = connected(&broker, "producer").await;
        producer.set_producer("devices").await.unwrap();

        let mut reader = connected(&broker, "reader").await;
        reader.set_consumer("devices", "INSERT").await.unwrap();

        producer.send("DELETE", b"1".to_vec()).await.unwrap();
        producer.send("INSERT", b"2".to_vec()).await.unwrap();

        let delivery = reader.recv().await.unwrap();
        assert_eq!(delivery.subject, "INSERT");
        assert_eq!(
            delivery.kind,
            DeliveryKind::Stream {
                stream: "devices".to_string()
            }
        );
        assert_eq!(delivery.kind.to_string(), "STREAM DELIVER");
    }

    #[tokio::test]
    async fn send_requires_producer_and_connection() {
        let broker = LocalBroker::new();
        let mut client = broker.client();

        assert!(matches!(
            client.set_producer("devices").await,
            Err(BrokerError::NotConnected)
        ));

        client.connect(ENDPOINT, TIMEOUT, "client").await.unwrap();
        assert!(matches!(
            client.send("INSERT", Vec::new()).await,
            Err(BrokerError::NoProducer)
        ));
    }

    #[tokio::test]
    async fn dropped_client_leaves_the_hub() {
        let broker = LocalBroker::new();
        let mut alice = connected(&broker, "alice").await;
        drop(connected(&broker, "bob").await);

        assert!(matches!(
            alice.sendto("bob", "LOOKUP", Vec::new()).await,
            Err(BrokerError::UnknownAddress(_))
        ));
    }
}
