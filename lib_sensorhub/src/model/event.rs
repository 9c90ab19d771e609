//! # Telemetry Event
//!
//! An [`Event`] is one timestamped sensor reading. Its fields are a closed set
//! of JSON scalars ([`FieldValue`]) keyed by name, and its `timestamp` is always
//! assigned by this service at receipt time, never by the upstream device.
//!
//! On the wire an event is a flat JSON object:
//!
//! ```json
//! { "gerakan": true, "jarak_cm": 42, "mq2": 310.5, "timestamp": "2025-01-01T10:00:00.123Z" }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Reserved key carrying the server-assigned receipt time.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Reserved key carrying the store-assigned document id in query results.
pub const ID_KEY: &str = "id";

/// Keys a sensor field may never use.
pub const RESERVED_KEYS: [&str; 2] = [TIMESTAMP_KEY, ID_KEY];

/// A single scalar sensor reading.
///
/// Serialized untagged, so the wire form is the bare JSON scalar. Numbers are
/// kept as [`serde_json::Number`] so integer readings stay integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// A boolean reading such as a motion sensor.
    Bool(bool),
    /// Any numeric reading.
    Number(Number),
    /// Free-form text.
    Text(String),
}

impl FieldValue {
    /// Converts a JSON value into a field value. Returns `None` for `null`,
    /// arrays and objects, which are not valid sensor readings.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => Some(Self::Number(n.clone())),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// The JSON form of this value.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Number(Number::from(value))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Sensor fields of an event, ordered by key.
pub type SensorFields = BTreeMap<String, FieldValue>;

/// Reasons a raw payload cannot become an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),

    #[error("payload carries no scalar sensor fields")]
    NoFields,
}

/// # Event
///
/// One immutable, timestamped telemetry record. Events are shared behind an
/// `Arc` once built: the cache, the registries and in-flight sends all read
/// the same allocation. Decoding applies the same rules as [`Event::stamp_at`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct Event {
    #[serde(flatten)]
    fields: SensorFields,
    #[serde(with = "iso_millis")]
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Stamps `fields` with the current time.
    pub fn stamp(fields: SensorFields) -> Result<Self, EventError> {
        Self::stamp_at(fields, Utc::now())
    }

    /// Stamps `fields` with `at`, truncated to millisecond precision.
    ///
    /// Reserved keys (`timestamp`, `id`) already present in `fields` are
    /// discarded; the receipt time is authoritative. Fails with
    /// [`EventError::NoFields`] when nothing else remains.
    pub fn stamp_at(mut fields: SensorFields, at: DateTime<Utc>) -> Result<Self, EventError> {
        for key in RESERVED_KEYS {
            fields.remove(key);
        }
        if fields.is_empty() {
            return Err(EventError::NoFields);
        }
        Ok(Self {
            fields,
            timestamp: at.trunc_subsecs(3),
        })
    }

    pub fn fields(&self) -> &SensorFields {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The timestamp in its wire form, e.g. `2025-01-01T10:00:00.123Z`.
    pub fn timestamp_iso(&self) -> String {
        format_timestamp(&self.timestamp)
    }

    /// The event as a JSON object.
    pub fn to_json(&self) -> Value {
        let mut map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        map.insert(TIMESTAMP_KEY.to_string(), Value::String(self.timestamp_iso()));
        Value::Object(map)
    }

    /// The encoded form sent to subscribers.
    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(flatten)]
    fields: SensorFields,
    #[serde(with = "iso_millis")]
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawEvent> for Event {
    type Error = EventError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        Event::stamp_at(raw.fields, raw.timestamp)
    }
}

/// Extracts sensor fields from a raw bus payload.
///
/// The payload must be a UTF-8 JSON object. Scalar members become fields;
/// `null`, arrays, nested objects and the reserved `timestamp` and `id`
/// members are skipped.
pub fn fields_from_payload(payload: &[u8]) -> Result<SensorFields, EventError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| EventError::InvalidJson(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(EventError::NotAnObject(json_kind(&value)));
    };
    let fields = fields_from_object(&map);
    if fields.is_empty() {
        return Err(EventError::NoFields);
    }
    Ok(fields)
}

/// Keeps the scalar members of a JSON object, minus the reserved keys.
pub fn fields_from_object(map: &Map<String, Value>) -> SensorFields {
    map.iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| FieldValue::from_json(value).map(|v| (key.clone(), v)))
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}
