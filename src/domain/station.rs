use rand::Rng;
use thiserror::Error;

use crate::domain::logical_clock::LogicalClock;
use crate::domain::models::{Event, EventAction, OperationalState, StatusRecord};
use crate::domain::payload::{self, ParseError};
use crate::domain::topics;

const ENERGY_INCREMENT_MIN_KWH: f64 = 0.5;
const ENERGY_INCREMENT_MAX_KWH: f64 = 2.0;

/// A message the station wants on the bus, in publish order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Error)]
pub enum StationError {
    #[error("station {station_id} is already charging car {car_id}")]
    AlreadyCharging { station_id: String, car_id: String },
    #[error("station {0} has no car connected")]
    NoCarConnected(String),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StationState {
    Free,
    Charging { car_id: String, energy_kwh: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationSettings {
    pub arrival_probability: f64,
    pub completion_probability: f64,
}

#[derive(Debug)]
pub struct ChargingStation {
    station_id: String,
    clock: LogicalClock,
    state: StationState,
}

impl ChargingStation {
    pub fn new(station_id: &str) -> Self {
        Self {
            station_id: station_id.to_string(),
            clock: LogicalClock::new(),
            state: StationState::Free,
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn state(&self) -> &StationState {
        &self.state
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn is_charging(&self) -> bool {
        matches!(self.state, StationState::Charging { .. })
    }

    /// Retained offline status the bus publishes if this station vanishes.
    pub fn last_will(&self) -> Result<OutboundMessage, StationError> {
        Ok(OutboundMessage {
            topic: topics::status_topic(&self.station_id),
            payload: payload::encode(&StatusRecord::offline(&self.station_id))?,
            retain: true,
        })
    }

    pub fn status_record(&self) -> StatusRecord {
        match &self.state {
            StationState::Free => StatusRecord {
                charger_id: self.station_id.clone(),
                state: OperationalState::Free,
                car_id: None,
                energy_kwh: 0.0,
            },
            StationState::Charging { car_id, energy_kwh } => StatusRecord {
                charger_id: self.station_id.clone(),
                state: OperationalState::Busy,
                car_id: Some(car_id.clone()),
                energy_kwh: round_kwh(*energy_kwh),
            },
        }
    }

    pub fn status_message(&self) -> Result<OutboundMessage, StationError> {
        Ok(OutboundMessage {
            topic: topics::status_topic(&self.station_id),
            payload: payload::encode(&self.status_record())?,
            retain: true,
        })
    }

    pub fn car_arrives(&mut self, car_id: &str) -> Result<Vec<OutboundMessage>, StationError> {
        if let StationState::Charging {
            car_id: current, ..
        } = &self.state
        {
            return Err(StationError::AlreadyCharging {
                station_id: self.station_id.clone(),
                car_id: current.clone(),
            });
        }

        self.state = StationState::Charging {
            car_id: car_id.to_string(),
            energy_kwh: 0.0,
        };

        let event = Event {
            actor_id: self.station_id.clone(),
            action: EventAction::SessionStarted,
            car_id: car_id.to_string(),
            charger_id: self.station_id.clone(),
            logical_timestamp: self.clock.send_event(),
            energy_kwh: None,
        };

        Ok(vec![self.event_message(&event)?, self.status_message()?])
    }

    /// Accumulates energy for the connected car and republishes the status.
    /// The clock does not move: a status snapshot is not a causal event.
    pub fn charge_tick(
        &mut self,
        increment_kwh: f64,
    ) -> Result<Option<OutboundMessage>, StationError> {
        let StationState::Charging { energy_kwh, .. } = &mut self.state else {
            return Ok(None);
        };
        *energy_kwh += increment_kwh.max(0.0);

        self.status_message().map(Some)
    }

    pub fn complete_charge(&mut self) -> Result<Vec<OutboundMessage>, StationError> {
        let (car_id, energy_kwh) = match &self.state {
            StationState::Free => {
                return Err(StationError::NoCarConnected(self.station_id.clone()));
            }
            StationState::Charging { car_id, energy_kwh } => (car_id.clone(), *energy_kwh),
        };

        let event = Event {
            actor_id: self.station_id.clone(),
            action: EventAction::SessionEnded,
            car_id,
            charger_id: self.station_id.clone(),
            logical_timestamp: self.clock.send_event(),
            energy_kwh: Some(round_kwh(energy_kwh)),
        };
        let event_message = self.event_message(&event)?;

        self.state = StationState::Free;

        Ok(vec![event_message, self.status_message()?])
    }

    /// Merges the clock with an event seen on the fleet-wide events topic.
    /// Returns `None` for this station's own echo.
    pub fn observe_remote(&self, topic: &str, raw: &str) -> Result<Option<u64>, ParseError> {
        if topics::station_of(topic) == Some(self.station_id.as_str()) {
            return Ok(None);
        }

        let remote = payload::parse_timestamp(raw)?;
        Ok(Some(self.clock.receive_event(remote)))
    }

    /// One simulation tick: a free station may admit a new car, a charging one
    /// draws energy and may finish.
    pub fn simulate_step<R: Rng>(
        &mut self,
        rng: &mut R,
        settings: &SimulationSettings,
    ) -> Result<Vec<OutboundMessage>, StationError> {
        if !self.is_charging() {
            if rng.gen_bool(settings.arrival_probability) {
                let car_id = format!("Car_{}", rng.gen_range(100..=999));
                return self.car_arrives(&car_id);
            }
            return Ok(Vec::new());
        }

        let increment = rng.gen_range(ENERGY_INCREMENT_MIN_KWH..ENERGY_INCREMENT_MAX_KWH);
        let mut messages: Vec<OutboundMessage> = self.charge_tick(increment)?.into_iter().collect();

        if rng.gen_bool(settings.completion_probability) {
            messages.extend(self.complete_charge()?);
        }

        Ok(messages)
    }

    fn event_message(&self, event: &Event) -> Result<OutboundMessage, StationError> {
        Ok(OutboundMessage {
            topic: topics::events_topic(&self.station_id),
            payload: payload::encode(event)?,
            retain: false,
        })
    }
}

fn round_kwh(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
