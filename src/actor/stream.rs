//! Stream Filter: broadcast deliveries must carry DEVICE messages.
//!
//! Accepted messages are not consumed any further yet.

use super::{DeviceActor, Running};
use crate::broker::Delivery;
use crate::proto::{ProtoKind, ProtoMessage};
use tracing::{debug, warn};

impl DeviceActor<Running> {
    pub(super) fn recv_stream(&mut self, stream: &str, delivery: &Delivery, msg: &ProtoMessage) {
        if msg.kind() != ProtoKind::Device {
            if self.verbose {
                warn!(
                    "Message from sender={}, with subject={} on {} is not DEVICE",
                    delivery.sender, delivery.subject, stream
                );
            }
            return;
        }

        debug!(
            "Stream {} delivered {} from {}",
            stream, delivery.subject, delivery.sender
        );
    }
}
