//! # Device protocol codec
//!
//! Wire representation of the messages exchanged on the broker. A message is
//! one of three kinds:
//!
//! ```text
//! DEVICE  - a device record (name, time, size, ext)
//! OK      - positive acknowledgement
//! ERROR   - numeric code plus human readable description
//! ```
//!
//! Messages are carried as JSON objects tagged by an `id` field, so the broker
//! payload stays self-describing and any subscriber can check the kind before
//! touching the body.

pub mod device;

pub use device::{DeviceRecord, EXT_CNT, EXT_SEQ};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind tag of a [`ProtoMessage`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoKind {
    Device,
    Ok,
    Error,
}

impl fmt::Display for ProtoKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtoKind::Device => write!(f, "DEVICE"),
            ProtoKind::Ok => write!(f, "OK"),
            ProtoKind::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "id", rename_all = "UPPERCASE")]
pub enum ProtoMessage {
    Device(DeviceRecord),
    Ok,
    Error { code: u16, description: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("Failed to decode message: {0}")]
    Decode(serde_json::Error),

    #[error("Failed to encode message: {0}")]
    Encode(serde_json::Error),
}

impl ProtoMessage {
    pub fn error(code: u16, description: impl Into<String>) -> Self {
        ProtoMessage::Error {
            code,
            description: description.into(),
        }
    }

    pub fn kind(&self) -> ProtoKind {
        match self {
            ProtoMessage::Device(_) => ProtoKind::Device,
            ProtoMessage::Ok => ProtoKind::Ok,
            ProtoMessage::Error { .. } => ProtoKind::Error,
        }
    }

    pub fn device(&self) -> Option<&DeviceRecord> {
        match self {
            ProtoMessage::Device(record) => Some(record),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(ProtoError::Encode)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(payload).map_err(ProtoError::Decode)
    }
}

impl From<DeviceRecord> for ProtoMessage {
    fn from(record: DeviceRecord) -> Self {
        ProtoMessage::Device(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_payload_is_tagged() {
        let msg = ProtoMessage::from(DeviceRecord::new("device1", 42, 1024));
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["id"], "DEVICE");
        assert_eq!(value["name"], "device1");
        assert_eq!(value["size"], 1024);
    }

    #[test]
    fn decode_accepts_device_without_ext() {
        let msg = ProtoMessage::decode(br#"{"id":"DEVICE","name":"d","time":1,"size":2}"#).unwrap();

        assert_eq!(msg.kind(), ProtoKind::Device);
        assert!(msg.device().unwrap().ext.is_empty());
    }

    #[test]
    fn decode_error_reply() {
        let msg =
            ProtoMessage::decode(br#"{"id":"ERROR","code":404,"description":"No devices"}"#)
                .unwrap();

        assert_eq!(msg, ProtoMessage::error(404, "No devices"));
        assert_eq!(msg.kind().to_string(), "ERROR");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            ProtoMessage::decode(b"\x00\x01garbage"),
            Err(ProtoError::Decode(_))
        ));
        assert!(ProtoMessage::decode(br#"{"id":"PING"}"#).is_err());
    }

    #[test]
    fn decode_error_carries_its_cause_once() {
        let err = ProtoMessage::decode(b"{").unwrap_err();

        assert!(err.to_string().starts_with("Failed to decode message: "));
        assert!(std::error::Error::source(&err).is_none());
    }
}
