//! Mailbox Protocol Handler
//!
//! Point-to-point requests and what they answer. Every reply goes back to the
//! sender under subject `LOOKUP`, whatever the request subject was.
//!
//! | subject     | reply                                              |
//! |-------------|----------------------------------------------------|
//! | INSERT      | OK, after the record is published as `INSERT`      |
//! | DELETE      | OK, after the record is published as `DELETE`      |
//! | LOOKUP      | the DEVICE, or ERROR 404                           |
//! | GET-ALL     | one DEVICE per record tagged `_seq`/`_cnt`, or 404  |
//! | PUBLISH-ALL | nothing, records are published as `PUBLISH-ALL`    |
//! | other       | ERROR 403                                          |

use super::{DeviceActor, Running};
use crate::proto::{DeviceRecord, ProtoMessage, EXT_CNT, EXT_SEQ};
use crate::registry::DeviceRegistry;
use std::fmt;
use tracing::{debug, error, warn};

pub const REPLY_SUBJECT: &str = "LOOKUP";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxSubject {
    Insert,
    Delete,
    Lookup,
    GetAll,
    PublishAll,
    Unknown(String),
}

impl From<&str> for MailboxSubject {
    fn from(subject: &str) -> Self {
        match subject {
            "INSERT" => MailboxSubject::Insert,
            "DELETE" => MailboxSubject::Delete,
            "LOOKUP" => MailboxSubject::Lookup,
            "GET-ALL" => MailboxSubject::GetAll,
            "PUBLISH-ALL" => MailboxSubject::PublishAll,
            other => MailboxSubject::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for MailboxSubject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MailboxSubject::Insert => write!(f, "INSERT"),
            MailboxSubject::Delete => write!(f, "DELETE"),
            MailboxSubject::Lookup => write!(f, "LOOKUP"),
            MailboxSubject::GetAll => write!(f, "GET-ALL"),
            MailboxSubject::PublishAll => write!(f, "PUBLISH-ALL"),
            MailboxSubject::Unknown(subject) => write!(f, "{}", subject),
        }
    }
}

/// Copies of all records annotated with their position and the total count.
///
/// The count is taken once, before the first record is tagged.
pub fn sequence(devices: &DeviceRegistry) -> Vec<DeviceRecord> {
    let count = devices.len() as i64;
    devices
        .iter()
        .enumerate()
        .map(|(seq, record)| {
            let mut record = record.clone();
            record.set_ext_int(EXT_CNT, count);
            record.set_ext_int(EXT_SEQ, seq as i64);
            record
        })
        .collect()
}

fn expected_device(subject: &MailboxSubject, msg: &ProtoMessage) -> ProtoMessage {
    warn!("{} request carries a {} message", subject, msg.kind());
    ProtoMessage::error(400, "Expected DEVICE message")
}

impl DeviceActor<Running> {
    pub(super) async fn recv_mailbox(&mut self, sender: &str, subject: &str, msg: ProtoMessage) {
        let subject = MailboxSubject::from(subject);
        debug!("Mailbox {} from {}", subject, sender);

        let reply = match (&subject, msg) {
            (MailboxSubject::Insert, ProtoMessage::Device(record)) => {
                self.devices.insert(record.clone());
                self.publish(&record, "INSERT").await;
                ProtoMessage::Ok
            }
            (MailboxSubject::Delete, ProtoMessage::Device(request)) => {
                let removed = self.devices.delete(&request.name);
                self.publish(removed.as_ref().unwrap_or(&request), "DELETE")
                    .await;
                ProtoMessage::Ok
            }
            (MailboxSubject::Lookup, ProtoMessage::Device(request)) => {
                match self.devices.lookup(&request.name) {
                    Some(record) => ProtoMessage::Device(record.clone()),
                    None => ProtoMessage::error(404, "Requested device does not exist"),
                }
            }
            (MailboxSubject::Insert | MailboxSubject::Delete | MailboxSubject::Lookup, msg) => {
                expected_device(&subject, &msg)
            }
            (MailboxSubject::GetAll, _) => {
                if self.devices.is_empty() {
                    ProtoMessage::error(404, "No devices")
                } else {
                    for record in sequence(&self.devices) {
                        self.reply(sender, &ProtoMessage::Device(record)).await;
                    }
                    return;
                }
            }
            (MailboxSubject::PublishAll, _) => {
                for record in sequence(&self.devices) {
                    self.publish(&record, "PUBLISH-ALL").await;
                }
                return;
            }
            (MailboxSubject::Unknown(_), _) => ProtoMessage::error(403, "Subject not found"),
        };

        self.reply(sender, &reply).await;
    }

    async fn reply(&mut self, sender: &str, msg: &ProtoMessage) {
        let Some(client) = self.broker.as_mut() else {
            warn!("No broker connection, dropping reply to {}", sender);
            return;
        };

        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };

        if let Err(e) = client.sendto(sender, REPLY_SUBJECT, payload).await {
            warn!("Failed to reply to {}: {}", sender, e);
        }
    }

    /// Broadcasts `record` on the producer stream, when one is declared.
    async fn publish(&mut self, record: &DeviceRecord, subject: &str) {
        let Some(client) = self.broker.as_mut() else {
            warn!("No broker connection, dropping {} of {}", subject, record.name);
            return;
        };
        if client.producer().is_none() {
            debug!("No producer stream, {} of {} not published", subject, record.name);
            return;
        }

        let payload = match ProtoMessage::Device(record.clone()).encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };

        if let Err(e) = client.send(subject, payload).await {
            warn!("Failed to publish {} of {}: {}", subject, record.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_parse_once() {
        assert_eq!(MailboxSubject::from("GET-ALL"), MailboxSubject::GetAll);
        assert_eq!(MailboxSubject::from("PUBLISH-ALL"), MailboxSubject::PublishAll);
        assert_eq!(
            MailboxSubject::from("insert"),
            MailboxSubject::Unknown("insert".to_string())
        );
        assert_eq!(MailboxSubject::GetAll.to_string(), "GET-ALL");
    }

    #[test]
    fn sequence_tags_every_record() {
        let mut devices = DeviceRegistry::new();
        for name in ["a", "b", "c"] {
            devices.insert(DeviceRecord::named(name));
        }

        let batch = sequence(&devices);

        assert_eq!(batch.len(), 3);
        for (i, record) in batch.iter().enumerate() {
            assert_eq!(record.ext_int(EXT_CNT, -1), 3);
            assert_eq!(record.ext_int(EXT_SEQ, -1), i as i64);
        }
        // stored records stay untouched
        assert!(devices.iter().all(|r| r.ext(EXT_SEQ).is_none()));
    }

    #[test]
    fn sequence_of_empty_registry_is_empty() {
        assert!(sequence(&DeviceRegistry::new()).is_empty());
    }
}
