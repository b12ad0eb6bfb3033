use std::collections::HashMap;

use crate::domain::logical_clock::LogicalClock;
use crate::domain::models::{Event, EventAction, Session, SessionState, Transaction};
use crate::domain::payload::{self, ParseError};

#[derive(Debug, Clone, PartialEq)]
pub enum BillingOutcome {
    SessionOpened {
        car_id: String,
        session: Session,
    },
    /// A second start for a car that already had an open session.
    SessionReplaced {
        car_id: String,
        previous: Session,
        current: Session,
    },
    Billed(Transaction),
    /// An end with no matching open session; never billed.
    Orphan { car_id: String, charger_id: String },
}

/// Billing-side session tracking. Closing a session and producing its
/// transaction happen in the same `&mut self` call, so a redelivered end
/// event finds no session and is treated as an orphan.
#[derive(Debug)]
pub struct BillingLedger {
    clock: LogicalClock,
    rate_per_kwh: f64,
    sessions: HashMap<String, Session>,
}

impl BillingLedger {
    pub fn new(rate_per_kwh: f64) -> Self {
        Self {
            clock: LogicalClock::new(),
            rate_per_kwh,
            sessions: HashMap::new(),
        }
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn rate_per_kwh(&self) -> f64 {
        self.rate_per_kwh
    }

    pub fn active_session(&self, car_id: &str) -> Option<&Session> {
        self.sessions.get(car_id)
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn handle_payload(&mut self, raw: &str) -> Result<BillingOutcome, ParseError> {
        let event = payload::parse_event(raw)?;
        self.handle_event(&event)
    }

    pub fn handle_event(&mut self, event: &Event) -> Result<BillingOutcome, ParseError> {
        self.clock.receive_event(event.logical_timestamp);

        match event.action {
            EventAction::SessionStarted => Ok(self.open_session(event)),
            EventAction::SessionEnded => {
                let energy_kwh = event
                    .energy_kwh
                    .ok_or(ParseError::MissingField("energy_kwh"))?;
                Ok(self.close_session(event, energy_kwh))
            }
        }
    }

    fn open_session(&mut self, event: &Event) -> BillingOutcome {
        let session = Session {
            charger_id: event.charger_id.clone(),
            start_timestamp: event.logical_timestamp,
            state: SessionState::Active,
        };

        match self.sessions.insert(event.car_id.clone(), session.clone()) {
            Some(previous) => BillingOutcome::SessionReplaced {
                car_id: event.car_id.clone(),
                previous,
                current: session,
            },
            None => BillingOutcome::SessionOpened {
                car_id: event.car_id.clone(),
                session,
            },
        }
    }

    fn close_session(&mut self, event: &Event, energy_kwh: f64) -> BillingOutcome {
        let Some(session) = self.sessions.remove(&event.car_id) else {
            return BillingOutcome::Orphan {
                car_id: event.car_id.clone(),
                charger_id: event.charger_id.clone(),
            };
        };

        BillingOutcome::Billed(Transaction {
            car_id: event.car_id.clone(),
            charger_id: session.charger_id,
            energy_kwh,
            cost: compute_cost(energy_kwh, self.rate_per_kwh),
            logical_timestamp: self.clock.send_event(),
        })
    }
}

/// Fixed-rate tariff, rounded to cents.
pub fn compute_cost(energy_kwh: f64, rate_per_kwh: f64) -> f64 {
    (energy_kwh * rate_per_kwh * 100.0).round() / 100.0
}
