use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::adapters::bus::BusConnector;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::retry::RetryPolicy;
use crate::app::runtime::{BillingActor, GatewayActor, StationActor};
use crate::app::services::TransactionStore;
use crate::domain::aggregator::EventAggregator;
use crate::domain::station::SimulationSettings;
use crate::domain::topics::is_valid_station_id;

const BILLING_ACTOR: &str = "billing";
const GATEWAY_ACTOR: &str = "gateway";

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("station id '{0}' must be non-empty and must not contain '/', '+' or '#'")]
    InvalidStationId(String),
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("{0} is not running")]
    NotRunning(String),
    #[error("failed to start {actor}: {source}")]
    Startup {
        actor: String,
        #[source]
        source: AppError,
    },
    #[error("actor threads panicked: {0}")]
    Panicked(String),
    #[error("fleet lock poisoned")]
    LockPoisoned,
}

impl From<FleetError> for AppError {
    fn from(error: FleetError) -> Self {
        match error {
            FleetError::Startup { source, .. } => source,
            other => AppError::runtime(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorSummary {
    pub name: String,
    pub running: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FleetSettings {
    pub rate_per_kwh: f64,
    pub simulation: SimulationSettings,
    pub tick_interval: Duration,
    pub retry: RetryPolicy,
}

impl FleetSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            rate_per_kwh: config.rate_per_kwh,
            simulation: SimulationSettings {
                arrival_probability: config.arrival_probability,
                completion_probability: config.completion_probability,
            },
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            retry: RetryPolicy::new(
                config.bus_connect_attempts,
                Duration::from_millis(config.bus_retry_delay_ms),
            ),
        }
    }
}

struct ActorThread {
    name: String,
    stop_flag: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ActorThread {
    fn spawn(
        name: String,
        actor: impl FnOnce(&AtomicBool) -> Result<(), AppError> + Send + 'static,
    ) -> Result<Self, FleetError> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let thread_stop = Arc::clone(&stop_flag);
        let thread_running = Arc::clone(&running);
        let thread_name = name.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(error) = actor(thread_stop.as_ref()) {
                    tracing::error!(actor = %thread_name, error = %error, "actor terminated");
                }
                thread_running.store(false, Ordering::Relaxed);
            })
            .map_err(|error| FleetError::Startup {
                actor: name.clone(),
                source: AppError::runtime(error),
            })?;

        Ok(Self {
            name,
            stop_flag,
            running,
            handle,
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Raises this actor's stop flag and waits for its thread. Returns the
    /// actor name if the thread panicked.
    fn stop(self) -> Result<(), String> {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.handle.join().map_err(|_| self.name)
    }
}

/// Station, billing and gateway threads started from one bus connector.
/// Each actor has its own stop flag, so any of them can be stopped and
/// restarted while the others keep running.
pub struct Fleet<B, S> {
    connector: B,
    store: S,
    settings: FleetSettings,
    stations: BTreeMap<String, ActorThread>,
    billing: Option<ActorThread>,
    gateway: Option<ActorThread>,
}

impl<B, S> Fleet<B, S>
where
    B: BusConnector,
    S: TransactionStore + Clone,
{
    pub fn new(connector: B, store: S, settings: FleetSettings) -> Self {
        Self {
            connector,
            store,
            settings,
            stations: BTreeMap::new(),
            billing: None,
            gateway: None,
        }
    }

    pub fn start_gateway(
        &mut self,
        aggregator: Arc<Mutex<EventAggregator>>,
    ) -> Result<(), FleetError> {
        reap(&mut self.gateway, GATEWAY_ACTOR)?;

        let gateway = GatewayActor::connect(&self.connector, aggregator, self.settings.retry)
            .map_err(|source| startup(GATEWAY_ACTOR, source))?;
        self.gateway = Some(ActorThread::spawn(GATEWAY_ACTOR.to_string(), move |stop| {
            gateway.run(stop)
        })?);
        Ok(())
    }

    pub fn start_billing(&mut self) -> Result<(), FleetError> {
        reap(&mut self.billing, BILLING_ACTOR)?;

        let billing = BillingActor::connect(
            &self.connector,
            self.settings.rate_per_kwh,
            self.store.clone(),
            self.settings.retry,
        )
        .map_err(|source| startup(BILLING_ACTOR, source))?;
        self.billing = Some(ActorThread::spawn(BILLING_ACTOR.to_string(), move |stop| {
            billing.run(stop)
        })?);
        Ok(())
    }

    pub fn stop_billing(&mut self) -> Result<(), FleetError> {
        let billing = self
            .billing
            .take()
            .filter(ActorThread::is_running)
            .ok_or_else(|| FleetError::NotRunning(BILLING_ACTOR.to_string()))?;
        billing.stop().map_err(FleetError::Panicked)
    }

    pub fn billing_running(&self) -> bool {
        self.billing.as_ref().is_some_and(ActorThread::is_running)
    }

    pub fn start_station(&mut self, station_id: &str) -> Result<(), FleetError> {
        if !is_valid_station_id(station_id) {
            return Err(FleetError::InvalidStationId(station_id.to_string()));
        }

        let mut existing = self.stations.remove(station_id);
        let label = format!("station {station_id}");
        if let Err(error) = reap(&mut existing, &label) {
            if let Some(thread) = existing {
                self.stations.insert(station_id.to_string(), thread);
            }
            return Err(error);
        }

        let station = StationActor::connect(
            &self.connector,
            station_id,
            self.settings.simulation,
            self.settings.tick_interval,
            self.settings.retry,
        )
        .map_err(|source| startup(&label, source))?;
        let thread = ActorThread::spawn(format!("station-{station_id}"), move |stop| {
            station.run(stop)
        })?;
        self.stations.insert(station_id.to_string(), thread);
        Ok(())
    }

    /// Stops one station. A station whose thread already ended is reaped
    /// and reported as not running.
    pub fn stop_station(&mut self, station_id: &str) -> Result<(), FleetError> {
        let thread = self
            .stations
            .remove(station_id)
            .ok_or_else(|| FleetError::NotRunning(format!("station {station_id}")))?;
        let was_running = thread.is_running();
        thread.stop().map_err(FleetError::Panicked)?;

        if was_running {
            tracing::info!(station_id, "station stopped on request");
            Ok(())
        } else {
            Err(FleetError::NotRunning(format!("station {station_id}")))
        }
    }

    pub fn stations(&self) -> Vec<ActorSummary> {
        self.stations
            .iter()
            .map(|(station_id, thread)| ActorSummary {
                name: station_id.clone(),
                running: thread.is_running(),
            })
            .collect()
    }

    /// Stations stop first so billing still receives their final
    /// `session_ended`, then billing drains its inbox, then the gateway.
    pub fn stop_all(&mut self) -> Result<(), FleetError> {
        let mut panicked = Vec::new();

        for (_, thread) in std::mem::take(&mut self.stations) {
            if let Err(name) = thread.stop() {
                panicked.push(name);
            }
        }
        for thread in [self.billing.take(), self.gateway.take()].into_iter().flatten() {
            if let Err(name) = thread.stop() {
                panicked.push(name);
            }
        }

        if panicked.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Panicked(panicked.join(", ")))
        }
    }
}

fn startup(actor: &str, source: AppError) -> FleetError {
    FleetError::Startup {
        actor: actor.to_string(),
        source,
    }
}

/// Clears a slot whose thread has already ended; refuses if it is still live.
fn reap(slot: &mut Option<ActorThread>, label: &str) -> Result<(), FleetError> {
    match slot.take() {
        Some(thread) if thread.is_running() => {
            *slot = Some(thread);
            Err(FleetError::AlreadyRunning(label.to_string()))
        }
        Some(thread) => thread.stop().map_err(FleetError::Panicked),
        None => Ok(()),
    }
}

/// Runtime control over a running fleet, as used by the HTTP layer.
pub trait FleetControl: Send + Sync {
    fn start_station(&self, station_id: &str) -> Result<(), FleetError>;
    fn stop_station(&self, station_id: &str) -> Result<(), FleetError>;
    fn stations(&self) -> Result<Vec<ActorSummary>, FleetError>;
    fn start_billing(&self) -> Result<(), FleetError>;
    fn stop_billing(&self) -> Result<(), FleetError>;
    fn billing_running(&self) -> Result<bool, FleetError>;
    fn stop_all(&self) -> Result<(), FleetError>;
}

/// A fleet behind a mutex; control operations are serialized.
pub struct SharedFleet<B, S> {
    fleet: Mutex<Fleet<B, S>>,
}

impl<B, S> SharedFleet<B, S>
where
    B: BusConnector,
    S: TransactionStore + Clone,
{
    pub fn new(fleet: Fleet<B, S>) -> Self {
        Self {
            fleet: Mutex::new(fleet),
        }
    }

    fn with_fleet<T>(
        &self,
        op: impl FnOnce(&mut Fleet<B, S>) -> Result<T, FleetError>,
    ) -> Result<T, FleetError> {
        let mut fleet: MutexGuard<'_, Fleet<B, S>> =
            self.fleet.lock().map_err(|_| FleetError::LockPoisoned)?;
        op(&mut fleet)
    }
}

impl<B, S> FleetControl for SharedFleet<B, S>
where
    B: BusConnector,
    S: TransactionStore + Clone,
{
    fn start_station(&self, station_id: &str) -> Result<(), FleetError> {
        self.with_fleet(|fleet| fleet.start_station(station_id))
    }

    fn stop_station(&self, station_id: &str) -> Result<(), FleetError> {
        self.with_fleet(|fleet| fleet.stop_station(station_id))
    }

    fn stations(&self) -> Result<Vec<ActorSummary>, FleetError> {
        self.with_fleet(|fleet| Ok(fleet.stations()))
    }

    fn start_billing(&self) -> Result<(), FleetError> {
        self.with_fleet(Fleet::start_billing)
    }

    fn stop_billing(&self) -> Result<(), FleetError> {
        self.with_fleet(Fleet::stop_billing)
    }

    fn billing_running(&self) -> Result<bool, FleetError> {
        self.with_fleet(|fleet| Ok(fleet.billing_running()))
    }

    fn stop_all(&self) -> Result<(), FleetError> {
        self.with_fleet(Fleet::stop_all)
    }
}
