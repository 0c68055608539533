//! Decoded samples and the messages relayed to downstream clients.
//!
//! Downstream messages are line-delimited JSON objects tagged by `type`.

use crate::error::ProtocolError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// One decoded reading: arrival time plus a value per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    timestamp: DateTime<Utc>,
    values: BTreeMap<String, f32>,
}

impl DecodedSample {
    pub fn new(timestamp: DateTime<Utc>, values: BTreeMap<String, f32>) -> Self {
        Self { timestamp, values }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the value of a channel.
    pub fn get(&self, channel: &str) -> Option<f32> {
        self.values.get(channel).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, f32> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Serialized flat: `{"type":"sample","timestamp":...,"<channel>":<value>,...}`.
impl Serialize for DecodedSample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len() + 2))?;
        map.serialize_entry("type", "sample")?;
        map.serialize_entry(
            "timestamp",
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Session lifecycle notices sent to the downstream client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayNotice {
    /// The sensor is connected and samples will follow.
    SessionStarted {
        session_id: String,
        sensor: String,
        vessel: String,
    },
    /// The sensor could not be reached; no session was started.
    DialFailed { sensor: String, message: String },
    /// The requested vessel profile is unknown or invalid.
    ConfigError { message: String },
    /// The request line could not be parsed.
    InvalidRequest { message: String },
    /// An active session ended for a reason on the sensor side.
    ConnectionLost {
        session_id: String,
        sensor: String,
        cause: String,
    },
}

/// Encodes a value as a JSON line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Request line sent by a downstream client to open a session.
///
/// Either a bare `host:port` or `{"sensor": "host:port", "vessel": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenRequest {
    pub sensor: String,
    #[serde(default)]
    pub vessel: Option<String>,
}

impl OpenRequest {
    /// Parses a request line. Returns `None` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if line.starts_with('{') {
            return Ok(Some(serde_json::from_str(line)?));
        }
        Ok(Some(Self {
            sensor: line.to_string(),
            vessel: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> DecodedSample {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let values = BTreeMap::from([
            ("concentration".to_string(), 2.0f32),
            ("flowRate".to_string(), 1.0f32),
        ]);
        DecodedSample::new(timestamp, values)
    }

    #[test]
    fn test_sample_serializes_flat() {
        let json: serde_json::Value = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["type"], "sample");
        assert_eq!(json["timestamp"], "2024-05-01T08:30:00.000Z");
        assert_eq!(json["flowRate"], 1.0);
        assert_eq!(json["concentration"], 2.0);
    }

    #[test]
    fn test_encode_line() {
        let line = encode_line(&sample()).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_notice_tags() {
        let notice = RelayNotice::DialFailed {
            sensor: "10.0.0.5:4001".to_string(),
            message: "connection refused".to_string(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "dial_failed");
        assert_eq!(json["sensor"], "10.0.0.5:4001");

        let parsed: RelayNotice = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, notice);
    }

    #[test]
    fn test_open_request_plain_address() {
        let request = OpenRequest::parse("127.0.0.1:4001\r\n").unwrap().unwrap();
        assert_eq!(request.sensor, "127.0.0.1:4001");
        assert_eq!(request.vessel, None);
    }

    #[test]
    fn test_open_request_json() {
        let request = OpenRequest::parse(r#"{"sensor":"10.1.1.1:4001","vessel":"hua_an_long"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(request.sensor, "10.1.1.1:4001");
        assert_eq!(request.vessel.as_deref(), Some("hua_an_long"));
    }

    #[test]
    fn test_open_request_blank_and_invalid() {
        assert!(OpenRequest::parse("   \n").unwrap().is_none());
        assert!(matches!(
            OpenRequest::parse("{\"vessel\":1}"),
            Err(ProtocolError::Json(_))
        ));
    }
}
