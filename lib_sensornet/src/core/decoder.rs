//! # Message Decoder
//!
//! Turns a raw bus payload into `RawTelemetry`. The payload must be UTF-8 text
//! holding a JSON object with at least an `ID`. Everything else is optional.
//!
//! Failures are returned as `DecodeError` values; the gateway logs them and
//! drops the message. Nothing in here panics on hostile input.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use super::record::{
    FieldValue, Metric, RawTelemetry, FIELD_LOCATION, FIELD_ORIGIN, FIELD_RECEIVED_AT,
    FIELD_SENSOR_TIME, FIELD_STATUS,
};

/// # Decode Error
///
/// Why a payload could not become a record.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload bytes are not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The text is not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// Valid JSON, but not an object.
    #[error("payload is JSON but not an object")]
    NotAnObject,

    /// The object has no usable `ID`.
    #[error("payload has no `ID` field")]
    MissingOrigin,

    /// A known field carries a value of the wrong shape.
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField {
        /// Wire name of the offending field.
        field: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Decodes one payload.
///
/// ## Rules
/// - `ID` may be a string or a number; empty strings count as missing.
/// - Metric fields take numbers or numeric strings; `null` means absent.
///   Non-finite values are rejected.
/// - `Tiempo_UTC`, `Location` and `Status` take any scalar, kept as text.
/// - Unknown scalar fields are kept in `extra`; unknown `null`, arrays and
///   objects are ignored.
/// - A payload-supplied `received_at` is ignored; arrival time belongs to the
///   gateway.
pub fn decode(payload: &[u8]) -> Result<RawTelemetry, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let value: Value = serde_json::from_str(text.trim())?;
    let Value::Object(object) = value else {
        return Err(DecodeError::NotAnObject);
    };
    decode_object(object)
}

fn decode_object(mut object: Map<String, Value>) -> Result<RawTelemetry, DecodeError> {
    let origin_id = match object.remove(FIELD_ORIGIN) {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(_)) | Some(Value::Null) | None => return Err(DecodeError::MissingOrigin),
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: FIELD_ORIGIN.to_string(),
                reason: "expected a string or a number".to_string(),
            })
        }
    };

    let mut raw = RawTelemetry::new(origin_id);

    for metric in Metric::ALL {
        if let Some(value) = object.remove(metric.wire_name()) {
            if let Some(reading) = metric_value(metric, value)? {
                raw.readings.set(metric, reading);
            }
        }
    }

    raw.sensor_time = text_value(FIELD_SENSOR_TIME, object.remove(FIELD_SENSOR_TIME))?;
    raw.location = text_value(FIELD_LOCATION, object.remove(FIELD_LOCATION))?;
    raw.status = text_value(FIELD_STATUS, object.remove(FIELD_STATUS))?;
    object.remove(FIELD_RECEIVED_AT);

    raw.extra = object
        .into_iter()
        .filter_map(|(name, value)| scalar(value).map(|v| (name, v)))
        .collect::<BTreeMap<_, _>>();

    Ok(raw)
}

fn metric_value(metric: Metric, value: Value) -> Result<Option<f64>, DecodeError> {
    let invalid = |reason: &str| DecodeError::InvalidField {
        field: metric.wire_name().to_string(),
        reason: reason.to_string(),
    };

    let number = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid("number out of range"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid("expected a numeric value"))?,
        _ => return Err(invalid("expected a numeric value")),
    };

    if number.is_finite() {
        Ok(Some(number))
    } else {
        Err(invalid("value is not finite"))
    }
}

fn text_value(field: &str, value: Option<Value>) -> Result<Option<String>, DecodeError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(DecodeError::InvalidField {
            field: field.to_string(),
            reason: "expected a scalar".to_string(),
        }),
    }
}

fn scalar(value: Value) -> Option<FieldValue> {
    match value {
        Value::String(s) => Some(FieldValue::Text(s)),
        Value::Bool(b) => Some(FieldValue::Bool(b)),
        Value::Number(n) => n.as_f64().map(FieldValue::Number),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
