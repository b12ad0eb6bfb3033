use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::logical_clock::MAX_LOGICAL_TIMESTAMP;
use crate::domain::models::{Event, EventAction, OperationalState, StatusRecord, Transaction};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload must be a JSON object")]
    InvalidPayloadType,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

const ACTOR_KEYS: &[&str] = &["actor_id", "actor"];
const ACTION_KEYS: &[&str] = &["action"];
const CAR_KEYS: &[&str] = &["car_id", "car"];
const CHARGER_KEYS: &[&str] = &["charger_id", "charger"];
const TIMESTAMP_KEYS: &[&str] = &["logical_timestamp", "timestamp"];
const ENERGY_KEYS: &[&str] = &["energy_kwh", "energy"];
const STATE_KEYS: &[&str] = &["state", "operational_state", "status"];
const COST_KEYS: &[&str] = &["cost", "total_cost"];

pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub fn parse_event(raw: &str) -> Result<Event, ParseError> {
    let value = parse_json(raw)?;
    let object = value.as_object().ok_or(ParseError::InvalidPayloadType)?;

    let action_raw = require_text(object, ACTION_KEYS, "action")?;
    let action = EventAction::parse(&action_raw).ok_or_else(|| ParseError::InvalidField {
        field: "action",
        reason: format!("unknown action '{action_raw}'"),
    })?;

    let charger_id = require_text(object, CHARGER_KEYS, "charger_id")?;
    let actor_id = find_text(object, ACTOR_KEYS).unwrap_or_else(|| charger_id.clone());

    let energy_kwh = match action {
        EventAction::SessionStarted => None,
        EventAction::SessionEnded => Some(require_energy(object, ENERGY_KEYS, "energy_kwh")?),
    };

    Ok(Event {
        actor_id,
        action,
        car_id: require_text(object, CAR_KEYS, "car_id")?,
        charger_id,
        logical_timestamp: require_timestamp(object)?,
        energy_kwh,
    })
}

pub fn parse_status(raw: &str) -> Result<StatusRecord, ParseError> {
    let value = parse_json(raw)?;
    let object = value.as_object().ok_or(ParseError::InvalidPayloadType)?;

    let state_raw = require_text(object, STATE_KEYS, "state")?;
    let state = OperationalState::parse(&state_raw).ok_or_else(|| ParseError::InvalidField {
        field: "state",
        reason: format!("unknown state '{state_raw}'"),
    })?;

    let energy_kwh = match find_value(object, ENERGY_KEYS) {
        Some(value) => energy_from_value(value, "energy_kwh")?,
        None => 0.0,
    };

    Ok(StatusRecord {
        charger_id: require_text(object, CHARGER_KEYS, "charger_id")?,
        state,
        car_id: find_text(object, CAR_KEYS),
        energy_kwh,
    })
}

pub fn parse_transaction(raw: &str) -> Result<Transaction, ParseError> {
    let value = parse_json(raw)?;
    let object = value.as_object().ok_or(ParseError::InvalidPayloadType)?;

    Ok(Transaction {
        car_id: require_text(object, CAR_KEYS, "car_id")?,
        charger_id: require_text(object, CHARGER_KEYS, "charger_id")?,
        energy_kwh: require_energy(object, ENERGY_KEYS, "energy_kwh")?,
        cost: require_energy(object, COST_KEYS, "cost")?,
        logical_timestamp: require_timestamp(object)?,
    })
}

/// Reads only the logical timestamp, for consumers that merge clocks without
/// otherwise interpreting the message.
pub fn parse_timestamp(raw: &str) -> Result<u64, ParseError> {
    let value = parse_json(raw)?;
    let object = value.as_object().ok_or(ParseError::InvalidPayloadType)?;
    require_timestamp(object)
}

fn parse_json(raw: &str) -> Result<Value, ParseError> {
    serde_json::from_str(raw).map_err(|error| ParseError::InvalidJson(error.to_string()))
}

fn require_timestamp(object: &Map<String, Value>) -> Result<u64, ParseError> {
    let value =
        find_value(object, TIMESTAMP_KEYS).ok_or(ParseError::MissingField("logical_timestamp"))?;

    let timestamp = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ParseError::InvalidField {
        field: "logical_timestamp",
        reason: "expected a non-negative integer".to_string(),
    })?;

    if timestamp > MAX_LOGICAL_TIMESTAMP {
        return Err(ParseError::InvalidField {
            field: "logical_timestamp",
            reason: format!("exceeds {MAX_LOGICAL_TIMESTAMP}"),
        });
    }

    Ok(timestamp)
}

fn require_energy(
    object: &Map<String, Value>,
    aliases: &[&str],
    field: &'static str,
) -> Result<f64, ParseError> {
    let value = find_value(object, aliases).ok_or(ParseError::MissingField(field))?;
    energy_from_value(value, field)
}

fn energy_from_value(value: &Value, field: &'static str) -> Result<f64, ParseError> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };

    match number {
        Some(number) if number.is_finite() && number >= 0.0 => Ok(number),
        _ => Err(ParseError::InvalidField {
            field,
            reason: "expected a non-negative number".to_string(),
        }),
    }
}

fn require_text(
    object: &Map<String, Value>,
    aliases: &[&str],
    field: &'static str,
) -> Result<String, ParseError> {
    find_text(object, aliases).ok_or(ParseError::MissingField(field))
}

fn find_text(object: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    match find_value(object, aliases)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn find_value<'a>(object: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    for alias in aliases {
        if let Some(value) = object.get(*alias) {
            return Some(value);
        }
    }

    let normalized_aliases: Vec<String> =
        aliases.iter().map(|alias| normalize_key(alias)).collect();

    object.iter().find_map(|(key, value)| {
        let normalized_key = normalize_key(key);
        if normalized_aliases
            .iter()
            .any(|alias| alias == &normalized_key)
        {
            Some(value)
        } else {
            None
        }
    })
}

fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|char| char.is_ascii_alphanumeric())
        .flat_map(|char| char.to_lowercase())
        .collect()
}
