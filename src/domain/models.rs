use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    SessionStarted,
    SessionEnded,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SessionEnded => "session_ended",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "session_started" => Some(Self::SessionStarted),
            "session_ended" => Some(Self::SessionEnded),
            _ => None,
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event published by a station on `charging/{id}/events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub actor_id: String,
    pub action: EventAction,
    pub car_id: String,
    pub charger_id: String,
    pub logical_timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_kwh: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalState {
    Free,
    Busy,
    Offline,
}

impl OperationalState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "free" => Some(Self::Free),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Latest-wins snapshot of one charger, retained at the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub charger_id: String,
    pub state: OperationalState,
    pub car_id: Option<String>,
    pub energy_kwh: f64,
}

impl StatusRecord {
    pub fn offline(charger_id: &str) -> Self {
        Self {
            charger_id: charger_id.to_string(),
            state: OperationalState::Offline,
            car_id: None,
            energy_kwh: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
}

/// Billing-side view of one car's open charging interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub charger_id: String,
    pub start_timestamp: u64,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub car_id: String,
    pub charger_id: String,
    pub energy_kwh: f64,
    pub cost: f64,
    pub logical_timestamp: u64,
}
