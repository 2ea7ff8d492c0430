//! # Broker client
//!
//! The device actor talks to the message broker through [`BrokerClient`].
//! The client model follows the Malamute pattern:
//!
//! ```text
//!             ┌────────────── mailbox (point to point) ──────────────┐
//! requester ──┤                                                       ├──► actor
//!             └── stream (publish/subscribe, filtered by subject) ───┘
//! ```
//!
//! - a client connects with an identity, which is also its mailbox address
//! - it may declare one producer stream which [`BrokerClient::send`] publishes on
//! - it may consume any number of streams, each with a subject pattern
//! - every received message is a [`Delivery`] tagged with its [`DeliveryKind`]
//!
//! Two transports exist: [`mqtt::MqttBroker`] maps the model onto an MQTT broker
//! and [`local::LocalBroker`] keeps everything in process.

pub mod local;
pub mod mqtt;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Addressed to this client's mailbox
    Mailbox,
    /// Received through a stream subscription
    Stream { stream: String },
}

impl fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeliveryKind::Mailbox => write!(f, "MAILBOX DELIVER"),
            DeliveryKind::Stream { .. } => write!(f, "STREAM DELIVER"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Delivery {
    pub kind: DeliveryKind,
    pub sender: String,
    pub subject: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Client is not connected")]
    NotConnected,

    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid name '{0}'")]
    InvalidName(String),

    #[error("Invalid subject pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: regex::Error,
    },

    #[error("No producer stream declared")]
    NoProducer,

    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Connection handle to the broker.
///
/// `recv` must be cancel safe: the actor polls it inside `tokio::select!`.
#[async_trait]
pub trait BrokerClient: Send {
    async fn connect(
        &mut self,
        endpoint: &str,
        timeout: Duration,
        address: &str,
    ) -> Result<(), BrokerError>;

    async fn set_producer(&mut self, stream: &str) -> Result<(), BrokerError>;

    async fn set_consumer(&mut self, stream: &str, pattern: &str) -> Result<(), BrokerError>;

    /// Publishes on the producer stream.
    async fn send(&mut self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Sends to the mailbox of `address`.
    async fn sendto(
        &mut self,
        address: &str,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Next delivery, `None` once the connection is gone for good.
    async fn recv(&mut self) -> Option<Delivery>;

    async fn disconnect(&mut self);

    fn producer(&self) -> Option<&str>;
}

/// Opens a fresh, unconnected client.
pub type BrokerFactory = Box<dyn FnMut() -> Box<dyn BrokerClient> + Send>;

/// Anchored regex for a subject pattern; a pattern must match the whole subject.
pub(crate) fn compile_pattern(pattern: &str) -> Result<regex::Regex, BrokerError> {
    regex::Regex::new(&format!("^(?:{})$", pattern)).map_err(|reason| {
        BrokerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        }
    })
}
