//! Typed message payloads and their JSON encodings.
//!
//! Payloads on the bus are UTF-8 JSON text. Most values are plain JSON, but
//! datetimes travel in the document-database extended-JSON convention so the
//! existing consumers keep parsing them: `{"$date": <millis-since-epoch>}`.
//! The queue-forwarding path uses plain JSON with datetimes as RFC 3339 text.
//!
//! [`Payload`] is the value type the rest of the crate serializes; anything
//! it cannot represent is rejected before a publish reaches the network.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Key of the extended-JSON datetime wrapper.
const DATE_KEY: &str = "$date";
/// Key of the canonical int64 wrapper nested inside `$date`.
const NUMBER_LONG_KEY: &str = "$numberLong";

/// Errors raised while encoding a [`Payload`].
#[derive(Debug, Error)]
pub enum PayloadError {
    /// JSON numbers cannot carry NaN or infinities.
    #[error("non-finite float {0} is not representable in JSON")]
    NonFiniteFloat(f64),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A message payload: JSON scalar/container types plus datetimes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    Array(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
}

impl Payload {
    /// Renders the payload as an extended-JSON value (datetimes wrapped in
    /// `$date`). This is the publish-path representation.
    pub fn to_extended_json(&self) -> Result<Value, PayloadError> {
        match self {
            Payload::Null => Ok(Value::Null),
            Payload::Bool(b) => Ok(Value::Bool(*b)),
            Payload::Int(i) => Ok(Value::Number(Number::from(*i))),
            Payload::Float(f) => float_value(*f),
            Payload::Text(s) => Ok(Value::String(s.clone())),
            Payload::DateTime(dt) => Ok(json!({ DATE_KEY: dt.timestamp_millis() })),
            Payload::Array(items) => items
                .iter()
                .map(Payload::to_extended_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Payload::Map(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_extended_json()?);
                }
                Ok(Value::Object(map))
            }
        }
    }

    /// Renders the payload as plain JSON (datetimes as RFC 3339 text). Used
    /// on the queue-forwarding path.
    pub fn to_plain_json(&self) -> Result<Value, PayloadError> {
        match self {
            Payload::DateTime(dt) => Ok(Value::String(
                dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            )),
            Payload::Float(f) => float_value(*f),
            Payload::Array(items) => items
                .iter()
                .map(Payload::to_plain_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Payload::Map(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_plain_json()?);
                }
                Ok(Value::Object(map))
            }
            other => other.to_extended_json(),
        }
    }

    /// Extended-JSON wire bytes.
    pub fn encode_extended(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(&self.to_extended_json()?)?)
    }

    /// Plain-JSON wire bytes.
    pub fn encode_plain(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(&self.to_plain_json()?)?)
    }

    /// Reads a payload back from an extended-JSON value.
    ///
    /// Accepts both the legacy `{"$date": <millis>}` wrapper this crate
    /// emits and the canonical `{"$date": {"$numberLong": "<millis>"}}` form
    /// produced by newer document-database drivers.
    pub fn from_extended_json(value: &Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(*b),
            Value::Number(n) => number_payload(n),
            Value::String(s) => Payload::Text(s.clone()),
            Value::Array(items) => {
                Payload::Array(items.iter().map(Payload::from_extended_json).collect())
            }
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(dt) = map.get(DATE_KEY).and_then(parse_date_wrapper) {
                        return Payload::DateTime(dt);
                    }
                }
                Payload::Map(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Payload::from_extended_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Parses extended-JSON wire bytes back into a payload.
    pub fn decode_extended(bytes: &[u8]) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Ok(Self::from_extended_json(&value))
    }
}

fn float_value(f: f64) -> Result<Value, PayloadError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or(PayloadError::NonFiniteFloat(f))
}

fn number_payload(n: &Number) -> Payload {
    if let Some(i) = n.as_i64() {
        Payload::Int(i)
    } else {
        // u64 out of i64 range or a true float; either way f64 is the
        // closest representation we carry.
        Payload::Float(n.as_f64().unwrap_or(0.0))
    }
}

/// Interprets the value nested under `$date`, in any of the forms the bus
/// has seen: legacy millis int, canonical `$numberLong` string, or relaxed
/// RFC 3339 text.
fn parse_date_wrapper(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        Value::Object(inner) => {
            let millis = inner.get(NUMBER_LONG_KEY)?.as_str()?.parse::<i64>().ok()?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Bool(b)
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Payload::Int(i)
    }
}

impl From<i32> for Payload {
    fn from(i: i32) -> Self {
        Payload::Int(i64::from(i))
    }
}

impl From<f64> for Payload {
    fn from(f: f64) -> Self {
        Payload::Float(f)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<DateTime<Utc>> for Payload {
    fn from(dt: DateTime<Utc>) -> Self {
        Payload::DateTime(dt)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(items: Vec<Payload>) -> Self {
        Payload::Array(items)
    }
}

impl<K: Into<String>, V: Into<Payload>> FromIterator<(K, V)> for Payload {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Payload::Map(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
