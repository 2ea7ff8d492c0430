use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extension key carrying the zero-based position inside a GET-ALL/PUBLISH-ALL sequence.
pub const EXT_SEQ: &str = "_seq";
/// Extension key carrying the total number of messages of a sequence.
pub const EXT_CNT: &str = "_cnt";

/// A named device with its telemetry attributes.
///
/// `ext` is the open annotation block. Domain data and the sequencing
/// fields ([`EXT_SEQ`], [`EXT_CNT`]) both live there as strings.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    pub name: String,
    /// Last seen timestamp in milliseconds
    pub time: u64,
    pub size: u64,
    #[serde(default)]
    pub ext: BTreeMap<String, String>,
}

impl DeviceRecord {
    pub fn new(name: impl Into<String>, time: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            time,
            size,
            ext: BTreeMap::new(),
        }
    }

    /// Record without attributes, used as the body of DELETE and LOOKUP requests.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, 0, 0)
    }

    pub fn with_ext(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext.insert(key.into(), value.into());
        self
    }

    pub fn ext(&self, key: &str) -> Option<&str> {
        self.ext.get(key).map(String::as_str)
    }

    pub fn set_ext_int(&mut self, key: &str, value: i64) {
        self.ext.insert(key.to_string(), value.to_string());
    }

    /// Integer view of an extension field, `default` when absent or not a number.
    pub fn ext_int(&self, key: &str, default: i64) -> i64 {
        self.ext(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext_int_falls_back_to_default() {
        let record = DeviceRecord::named("d").with_ext("vendor", "acme");

        assert_eq!(record.ext_int(EXT_SEQ, -1), -1);
        assert_eq!(record.ext_int("vendor", -1), -1);
    }

    #[test]
    fn set_ext_int_overwrites_previous_value() {
        let mut record = DeviceRecord::new("d", 1, 2);
        record.set_ext_int(EXT_CNT, 4);
        record.set_ext_int(EXT_CNT, 5);

        assert_eq!(record.ext(EXT_CNT), Some("5"));
        assert_eq!(record.ext_int(EXT_CNT, 0), 5);
    }
}
