//! Reading schema validation.
//!
//! The gateway validates raw JSON by hand instead of letting serde reject
//! the body wholesale, so a 400 can name every offending field at once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::types::{Reading, ReadingStatus};

/// One field-level validation failure.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Validate a raw JSON body into a [`Reading`].
///
/// Collects every violation rather than stopping at the first.
pub fn validate_reading(value: &Value) -> Result<Reading, Vec<FieldError>> {
    let mut errors = Vec::new();

    let Some(obj) = value.as_object() else {
        return Err(vec![FieldError::new("body", "expected a JSON object")]);
    };

    let meter_id = match obj.get("meterId").and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        Some(_) => {
            errors.push(FieldError::new("meterId", "must be non-empty"));
            String::new()
        }
        None => {
            errors.push(FieldError::new("meterId", "required string"));
            String::new()
        }
    };

    let region = match obj.get("region").and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        Some(_) => {
            errors.push(FieldError::new("region", "must be non-empty"));
            String::new()
        }
        None => {
            errors.push(FieldError::new("region", "required string"));
            String::new()
        }
    };

    let timestamp: DateTime<Utc> = match obj.get("timestamp").and_then(Value::as_str) {
        Some(raw) => match raw.parse() {
            Ok(ts) => ts,
            Err(_) => {
                errors.push(FieldError::new("timestamp", "must be an ISO-8601 timestamp"));
                Utc::now()
            }
        },
        None => {
            errors.push(FieldError::new("timestamp", "required ISO-8601 string"));
            Utc::now()
        }
    };

    let power_kw = match obj.get("powerKw").and_then(Value::as_f64) {
        Some(p) if p >= 0.0 && p.is_finite() => p,
        Some(_) => {
            errors.push(FieldError::new("powerKw", "must be >= 0"));
            0.0
        }
        None => {
            errors.push(FieldError::new("powerKw", "required number"));
            0.0
        }
    };

    let voltage = optional_range(obj, "voltage", 0.0, 500.0, &mut errors);
    let current = optional_min(obj, "current", 0.0, &mut errors);
    let frequency = optional_min(obj, "frequency", 0.0, &mut errors);
    let power_factor = optional_range(obj, "powerFactor", 0.0, 1.0, &mut errors);
    let energy_kwh = optional_min(obj, "energyKwh", 0.0, &mut errors);
    let generation_kw = optional_min(obj, "generationKw", 0.0, &mut errors);

    let seq = match obj.get("seq") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_u64() {
            Some(n) => Some(n),
            None => {
                errors.push(FieldError::new("seq", "must be a non-negative integer"));
                None
            }
        },
    };

    let status = match obj.get("status") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s == "OK" => Some(ReadingStatus::Ok),
        Some(Value::String(s)) if s == "ERROR" => Some(ReadingStatus::Error),
        Some(_) => {
            errors.push(FieldError::new("status", "must be OK or ERROR"));
            None
        }
    };

    let reading_id = match obj.get("readingId") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => match s.parse::<Uuid>() {
            Ok(id) => Some(id),
            Err(_) => {
                errors.push(FieldError::new("readingId", "must be a UUID"));
                None
            }
        },
        Some(_) => {
            errors.push(FieldError::new("readingId", "must be a UUID string"));
            None
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Reading {
        reading_id,
        meter_id,
        region,
        timestamp,
        power_kw,
        voltage,
        current,
        frequency,
        power_factor,
        energy_kwh,
        generation_kw,
        seq,
        status,
    })
}

fn optional_range(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    min: f64,
    max: f64,
    errors: &mut Vec<FieldError>,
) -> Option<f64> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_f64() {
            Some(x) if x >= min && x <= max && x.is_finite() => Some(x),
            _ => {
                errors.push(FieldError::new(field, format!("must be in [{min}, {max}]")));
                None
            }
        },
    }
}

fn optional_min(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    min: f64,
    errors: &mut Vec<FieldError>,
) -> Option<f64> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_f64() {
            Some(x) if x >= min && x.is_finite() => Some(x),
            _ => {
                errors.push(FieldError::new(field, format!("must be >= {min}")));
                None
            }
        },
    }
}
