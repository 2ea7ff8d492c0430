//! # Device actor
//!
//! Keeps the authoritative device table and serves it over the broker.
//!
//! ```text
//! supervisor ──[ControlRequest]──► ┌──────────────┐ ──► Connection Manager
//!                                  │ DeviceActor  │
//! broker ─────[Delivery]─────────► │ (one task)   │ ──► Mailbox handler ──► replies
//!                                  └──────────────┘ ──► Stream filter
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Initializing ──(ready signal)──► Running ──($TERM)──► Terminated ──► destroy
//! ```
//!
//! Everything happens on the actor task: handlers run to completion between
//! two waits, so a GET-ALL sequence is never interleaved with a STOP.

pub mod command;
pub mod connection;
pub mod error;
pub mod handle;
pub mod mailbox;
pub mod stream;

pub use command::{ControlCommand, ControlReply, ControlRequest};
pub use error::DeviceError;
pub use handle::DeviceActorHandle;

use crate::broker::{BrokerClient, BrokerFactory, Delivery, DeliveryKind};
use crate::config::DeviceConfig;
use crate::proto::ProtoMessage;
use crate::registry::DeviceRegistry;
use statum::{machine, state};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[state]
#[derive(Debug, Clone)]
pub enum ActorState {
    Initializing, // Created, not yet announced to the supervisor
    Running,      // Serving control and broker traffic
    Terminated,   // Loop left, resources not yet released
}

#[machine]
pub struct DeviceActor<S: ActorState> {
    pipe: mpsc::Receiver<ControlRequest>,
    factory: BrokerFactory,
    broker: Option<Box<dyn BrokerClient>>,
    config: Option<DeviceConfig>,
    devices: DeviceRegistry,
    terminated: bool,
    verbose: bool,
}

/// What woke the loop up
enum Readiness {
    Control(Option<ControlRequest>),
    Broker(Option<Delivery>),
}

async fn next_delivery(broker: &mut Option<Box<dyn BrokerClient>>) -> Option<Delivery> {
    match broker {
        Some(client) => client.recv().await,
        None => std::future::pending().await,
    }
}

impl DeviceActor<Initializing> {
    pub fn create(pipe: mpsc::Receiver<ControlRequest>, factory: BrokerFactory) -> Self {
        Self::new(
            pipe,
            factory,
            None,                  // broker
            None,                  // config
            DeviceRegistry::new(), // devices
            false,                 // terminated
            false,                 // verbose
        )
    }

    /// Tells the supervisor the actor is up.
    pub fn signal(self, ready: oneshot::Sender<()>) -> DeviceActor<Running> {
        if ready.send(()).is_err() {
            warn!("Supervisor is gone before the actor started");
        }
        self.transition()
    }
}

impl DeviceActor<Running> {
    /// Event loop, returns once `$TERM` was received or the control channel closed.
    pub async fn run(mut self) -> DeviceActor<Terminated> {
        info!("Device actor running");

        while !self.terminated {
            let readiness = tokio::select! {
                biased;

                request = self.pipe.recv() => Readiness::Control(request),
                delivery = next_delivery(&mut self.broker) => Readiness::Broker(delivery),
            };

            match readiness {
                Readiness::Control(Some(request)) => self.recv_api(request).await,
                Readiness::Control(None) => {
                    info!("Control channel closed, terminating");
                    self.terminated = true;
                }
                Readiness::Broker(Some(delivery)) => self.recv_broker(delivery).await,
                Readiness::Broker(None) => {
                    warn!("Broker connection lost, waiting for START");
                    self.broker = None;
                }
            }
        }

        self.transition()
    }

    async fn recv_broker(&mut self, delivery: Delivery) {
        debug!(
            "{} sender={} subject={}",
            delivery.kind, delivery.sender, delivery.subject
        );
        let msg = match ProtoMessage::decode(&delivery.payload) {
            Ok(msg) => msg,
            Err(e) => {
                if self.verbose {
                    warn!(
                        "Can't read message from sender={}, with subject={}: {}",
                        delivery.sender, delivery.subject, e
                    );
                }
                return;
            }
        };

        match &delivery.kind {
            DeliveryKind::Mailbox => {
                self.recv_mailbox(&delivery.sender, &delivery.subject, msg)
                    .await
            }
            DeliveryKind::Stream { stream } => self.recv_stream(stream, &delivery, &msg),
        }
    }
}

impl DeviceActor<Terminated> {
    /// Releases the connection and flushes the registry a last time.
    pub async fn destroy(mut self) {
        debug!("Destroying device actor");
        self.disconnect().await;
        if self.devices.file().is_none() && !self.devices.is_empty() {
            error!(
                "{} devices are lost, no server/file configured",
                self.devices.len()
            );
        }
        info!("Device actor stopped");
    }
}
