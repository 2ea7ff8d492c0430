//! Connection Manager
//!
//! (Re)establishes the broker connection from the current configuration:
//!
//! 1. endpoint and address must be configured
//! 2. the client handle is opened once and reused across reconnects
//! 3. connect with a bounded timeout
//! 4. declare the producer stream, if any
//! 5. declare every consumer subscription
//!
//! Any failing step aborts `connect` without rolling back earlier steps; the
//! supervisor retries by sending START again.

use super::{ActorState, DeviceActor, DeviceError, Running};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

impl DeviceActor<Running> {
    pub(super) async fn connect(&mut self) -> Result<(), DeviceError> {
        let Some(config) = self.config.as_ref() else {
            warn!("No configuration provided, there is nothing to do");
            return Err(DeviceError::NoConfiguration);
        };

        let endpoint = config.malamute.endpoint.clone().ok_or_else(|| {
            error!("malamute/endpoint is missing");
            DeviceError::MissingEndpoint
        })?;
        let address = config.malamute.address.clone().ok_or_else(|| {
            error!("malamute/address is missing");
            DeviceError::MissingAddress
        })?;
        let producer = config.malamute.producer.clone();
        let consumers = config.consumers();

        let factory = &mut self.factory;
        let client = self.broker.get_or_insert_with(|| {
            debug!("Opening broker client");
            factory()
        });

        client
            .connect(&endpoint, CONNECT_TIMEOUT, &address)
            .await
            .inspect_err(|e| warn!("Can't connect to malamute endpoint {}: {}", endpoint, e))?;

        if let Some(stream) = &producer {
            client
                .set_producer(stream)
                .await
                .inspect_err(|e| warn!("Can't setup publisher on stream {}: {}", stream, e))?;
        }

        for (stream, pattern) in &consumers {
            client
                .set_consumer(stream, pattern)
                .await
                .inspect_err(|e| warn!("Can't setup consumer {}/{}: {}", stream, pattern, e))?;
        }

        info!(
            "Connected to {} as {} (producer: {}, consumers: {})",
            endpoint,
            address,
            producer.as_deref().unwrap_or("-"),
            consumers.len()
        );
        Ok(())
    }
}

impl<S: ActorState> DeviceActor<S> {
    /// Drops the broker client and flushes the registry. Safe to call repeatedly.
    pub(super) async fn disconnect(&mut self) {
        if let Some(mut client) = self.broker.take() {
            client.disconnect().await;
            info!("Broker connection closed");
        }

        if let Err(e) = self.devices.store().await {
            error!("Failed to persist devices: {}", e);
        }
    }
}
