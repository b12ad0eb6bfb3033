use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::bus::{
    BusClient, BusConnector, BusMessage, ConnectOptions, InMemoryBroker, LastWill,
};
use crate::adapters::db;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::fleet::{Fleet, FleetControl, FleetSettings, SharedFleet};
use crate::app::retry::{RetryPolicy, retry_with_fixed_delay};
use crate::app::services::{SqliteTransactionStore, TransactionStore};
use crate::domain::aggregator::EventAggregator;
use crate::domain::billing::{BillingLedger, BillingOutcome};
use crate::domain::models::Transaction;
use crate::domain::payload;
use crate::domain::station::{ChargingStation, OutboundMessage, SimulationSettings};
use crate::domain::topics::{ALL_STATION_EVENTS, ALL_STATION_STATUS, TRANSACTIONS};

/// Upper bound on how long an actor waits before re-checking its stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

const BILLING_CLIENT_ID: &str = "billing-service";
const GATEWAY_CLIENT_ID: &str = "gateway";

pub fn connect_with_retry<B: BusConnector>(
    connector: &B,
    options: &ConnectOptions,
    policy: RetryPolicy,
) -> Result<B::Client, AppError> {
    retry_with_fixed_delay(
        policy,
        "bus_connect",
        || connector.connect(options),
        |error| error.is_transient(),
    )
    .map_err(|failure| AppError::BusUnavailable {
        client_id: options.client_id.clone(),
        attempts: failure.attempts,
        reason: failure.error.to_string(),
    })
}

fn publish_all<C: BusClient>(client: &C, messages: &[OutboundMessage]) {
    for message in messages {
        if let Err(error) = client.publish(&message.topic, &message.payload, message.retain) {
            tracing::warn!(
                client_id = client.client_id(),
                topic = %message.topic,
                error = %error,
                "publish failed"
            );
        }
    }
}

/// Waits for one inbound message, returning `Ok(None)` on timeout. A receive
/// error means the connection is gone and the actor loop must end.
fn next_message<C: BusClient>(
    client: &C,
    timeout: Duration,
) -> Result<Option<BusMessage>, AppError> {
    client.recv_timeout(timeout).map_err(AppError::bus)
}

pub struct StationActor<C> {
    station: ChargingStation,
    client: C,
    settings: SimulationSettings,
    tick_interval: Duration,
    rng: StdRng,
}

impl<C: BusClient> StationActor<C> {
    /// Connects with the offline last-will registered, subscribes to the fleet
    /// events and announces the initial free status.
    pub fn connect<B>(
        connector: &B,
        station_id: &str,
        settings: SimulationSettings,
        tick_interval: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, AppError>
    where
        B: BusConnector<Client = C>,
    {
        let station = ChargingStation::new(station_id);
        let will = station.last_will().map_err(AppError::runtime)?;
        let options = ConnectOptions::new(&format!("station-{station_id}")).with_last_will(
            LastWill {
                topic: will.topic,
                payload: will.payload,
                retain: will.retain,
            },
        );

        let client = connect_with_retry(connector, &options, retry)?;
        client
            .subscribe(ALL_STATION_EVENTS)
            .map_err(AppError::bus)?;

        let actor = Self {
            station,
            client,
            settings,
            tick_interval,
            rng: StdRng::from_entropy(),
        };
        let status = actor.station.status_message().map_err(AppError::runtime)?;
        publish_all(&actor.client, &[status]);

        tracing::info!(station_id, "station online");
        Ok(actor)
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn station(&self) -> &ChargingStation {
        &self.station
    }

    pub fn handle_inbound(&mut self, message: &BusMessage) {
        match self.station.observe_remote(&message.topic, &message.payload) {
            Ok(Some(timestamp)) => tracing::debug!(
                station_id = self.station.station_id(),
                topic = %message.topic,
                logical_timestamp = timestamp,
                "clock merged with remote event"
            ),
            Ok(None) => {}
            Err(error) => tracing::warn!(
                station_id = self.station.station_id(),
                topic = %message.topic,
                error = %error,
                "ignoring malformed event"
            ),
        }
    }

    pub fn step(&mut self) {
        match self.station.simulate_step(&mut self.rng, &self.settings) {
            Ok(messages) => publish_all(&self.client, &messages),
            Err(error) => tracing::warn!(
                station_id = self.station.station_id(),
                error = %error,
                "simulation step failed"
            ),
        }
    }

    /// Handles at most one inbound message. Returns whether one arrived.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<bool, AppError> {
        match next_message(&self.client, timeout)? {
            Some(message) => {
                self.handle_inbound(&message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn run(mut self, stop_flag: &AtomicBool) -> Result<(), AppError> {
        let mut next_tick = Instant::now() + self.tick_interval;

        while !stop_flag.load(Ordering::Relaxed) {
            let wait = next_tick
                .saturating_duration_since(Instant::now())
                .min(STOP_POLL_INTERVAL);
            self.poll_once(wait)?;

            if Instant::now() >= next_tick {
                self.step();
                next_tick = Instant::now() + self.tick_interval;
            }
        }

        self.shutdown()
    }

    /// Ends an active session, then leaves the bus cleanly so the last-will
    /// is discarded.
    pub fn shutdown(mut self) -> Result<(), AppError> {
        if self.station.is_charging() {
            match self.station.complete_charge() {
                Ok(messages) => publish_all(&self.client, &messages),
                Err(error) => tracing::warn!(
                    station_id = self.station.station_id(),
                    error = %error,
                    "failed to flush active session on shutdown"
                ),
            }
        }

        if let Err(error) = self.client.unsubscribe(ALL_STATION_EVENTS) {
            tracing::warn!(station_id = self.station.station_id(), error = %error, "unsubscribe failed");
        }
        self.client.disconnect().map_err(AppError::bus)?;

        tracing::info!(station_id = self.station.station_id(), "station stopped");
        Ok(())
    }
}

pub struct BillingActor<C, S> {
    ledger: BillingLedger,
    client: C,
    store: S,
}

impl<C: BusClient, S: TransactionStore> BillingActor<C, S> {
    pub fn connect<B>(
        connector: &B,
        rate_per_kwh: f64,
        store: S,
        retry: RetryPolicy,
    ) -> Result<Self, AppError>
    where
        B: BusConnector<Client = C>,
    {
        let client = connect_with_retry(connector, &ConnectOptions::new(BILLING_CLIENT_ID), retry)?;
        client
            .subscribe(ALL_STATION_EVENTS)
            .map_err(AppError::bus)?;

        let ledger = BillingLedger::new(rate_per_kwh);
        tracing::info!(rate_per_kwh = ledger.rate_per_kwh(), "billing service online");
        Ok(Self {
            ledger,
            client,
            store,
        })
    }

    pub fn ledger(&self) -> &BillingLedger {
        &self.ledger
    }

    /// Applies one event. A billed transaction is published before the
    /// best-effort insert, so storage failures never hide it from the bus.
    pub fn handle_inbound(&mut self, message: &BusMessage) -> Option<Transaction> {
        let outcome = match self.ledger.handle_payload(&message.payload) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(topic = %message.topic, error = %error, "ignoring malformed event");
                return None;
            }
        };

        match outcome {
            BillingOutcome::SessionOpened { car_id, session } => {
                tracing::info!(
                    car_id = %car_id,
                    charger_id = %session.charger_id,
                    start_timestamp = session.start_timestamp,
                    "session opened"
                );
                None
            }
            BillingOutcome::SessionReplaced {
                car_id,
                previous,
                current,
            } => {
                tracing::warn!(
                    car_id = %car_id,
                    previous_charger_id = %previous.charger_id,
                    charger_id = %current.charger_id,
                    "session started twice for the same car; previous session discarded"
                );
                None
            }
            BillingOutcome::Orphan { car_id, charger_id } => {
                tracing::warn!(
                    car_id = %car_id,
                    charger_id = %charger_id,
                    "session end without an open session; not billed"
                );
                None
            }
            BillingOutcome::Billed(transaction) => {
                self.publish_transaction(&transaction);
                self.persist_transaction(&transaction);
                Some(transaction)
            }
        }
    }

    fn publish_transaction(&self, transaction: &Transaction) {
        let encoded = match payload::encode(transaction) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::warn!(car_id = %transaction.car_id, error = %error, "failed to encode transaction");
                return;
            }
        };

        if let Err(error) = self.client.publish(TRANSACTIONS, &encoded, false) {
            tracing::warn!(car_id = %transaction.car_id, error = %error, "failed to publish transaction");
        }
    }

    fn persist_transaction(&self, transaction: &Transaction) {
        match self.store.insert_transaction(transaction) {
            Ok(row_id) => tracing::info!(
                row_id,
                car_id = %transaction.car_id,
                charger_id = %transaction.charger_id,
                energy_kwh = transaction.energy_kwh,
                cost = transaction.cost,
                logical_timestamp = transaction.logical_timestamp,
                "transaction recorded"
            ),
            Err(error) => tracing::warn!(
                car_id = %transaction.car_id,
                logical_timestamp = transaction.logical_timestamp,
                error = %error,
                "failed to persist transaction"
            ),
        }
    }

    pub fn poll_once(&mut self, timeout: Duration) -> Result<bool, AppError> {
        match next_message(&self.client, timeout)? {
            Some(message) => {
                self.handle_inbound(&message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs until stopped, then handles whatever is already queued so that
    /// sessions ended by stopping stations are still billed.
    pub fn run(mut self, stop_flag: &AtomicBool) -> Result<(), AppError> {
        while !stop_flag.load(Ordering::Relaxed) {
            self.poll_once(STOP_POLL_INTERVAL)?;
        }
        while self.poll_once(Duration::ZERO)? {}
        self.shutdown()
    }

    pub fn shutdown(mut self) -> Result<(), AppError> {
        if self.ledger.active_session_count() > 0 {
            tracing::warn!(
                open_sessions = self.ledger.active_session_count(),
                "billing stopped with open sessions"
            );
        }
        if let Err(error) = self.client.unsubscribe(ALL_STATION_EVENTS) {
            tracing::warn!(error = %error, "unsubscribe failed");
        }
        self.client.disconnect().map_err(AppError::bus)?;
        tracing::info!("billing service stopped");
        Ok(())
    }
}

/// Feeds every status, event and transaction into the shared aggregator.
pub struct GatewayActor<C> {
    client: C,
    aggregator: Arc<Mutex<EventAggregator>>,
}

impl<C: BusClient> GatewayActor<C> {
    pub fn connect<B>(
        connector: &B,
        aggregator: Arc<Mutex<EventAggregator>>,
        retry: RetryPolicy,
    ) -> Result<Self, AppError>
    where
        B: BusConnector<Client = C>,
    {
        let client = connect_with_retry(connector, &ConnectOptions::new(GATEWAY_CLIENT_ID), retry)?;
        for filter in [ALL_STATION_STATUS, ALL_STATION_EVENTS, TRANSACTIONS] {
            client.subscribe(filter).map_err(AppError::bus)?;
        }

        Ok(Self { client, aggregator })
    }

    pub fn handle_inbound(&self, message: &BusMessage) {
        let Ok(mut aggregator) = self.aggregator.lock() else {
            tracing::warn!(topic = %message.topic, "aggregator lock poisoned; message skipped");
            return;
        };

        match aggregator.ingest(&message.topic, &message.payload) {
            Ok(report) if report.fan_out.dropped > 0 => tracing::debug!(
                topic = %message.topic,
                dropped = report.fan_out.dropped,
                "slow viewers skipped"
            ),
            Ok(_) => {}
            Err(error) => tracing::warn!(error = %error, "ignoring message"),
        }
    }

    pub fn poll_once(&mut self, timeout: Duration) -> Result<bool, AppError> {
        match next_message(&self.client, timeout)? {
            Some(message) => {
                self.handle_inbound(&message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn run(mut self, stop_flag: &AtomicBool) -> Result<(), AppError> {
        while !stop_flag.load(Ordering::Relaxed) {
            self.poll_once(STOP_POLL_INTERVAL)?;
        }
        self.client.disconnect().map_err(AppError::bus)
    }
}

fn open_store(config: &AppConfig) -> Result<SqliteTransactionStore, AppError> {
    let mut connection = db::open_connection(&config.db_path).map_err(AppError::database_init)?;
    db::run_migrations(&mut connection).map_err(AppError::database_init)?;
    Ok(SqliteTransactionStore::new(Arc::new(Mutex::new(connection))))
}

/// Starts billing and every configured station.
fn start_simulation<B, S>(fleet: &mut Fleet<B, S>, config: &AppConfig) -> Result<(), AppError>
where
    B: BusConnector,
    S: TransactionStore + Clone,
{
    fleet.start_billing()?;
    for station_id in &config.station_ids {
        fleet.start_station(station_id)?;
    }
    Ok(())
}

/// On a failed startup, stops whatever is already running before returning
/// the error.
fn stop_on_error<B, S>(
    fleet: &mut Fleet<B, S>,
    result: Result<(), AppError>,
) -> Result<(), AppError>
where
    B: BusConnector,
    S: TransactionStore + Clone,
{
    if result.is_err() {
        if let Err(stop_error) = fleet.stop_all() {
            tracing::warn!(error = %stop_error, "cleanup after failed startup");
        }
    }
    result
}

pub fn run(config: AppConfig) -> Result<(), AppError> {
    let broker = InMemoryBroker::from_url(&config.bus_url).map_err(AppError::config)?;
    let store = open_store(&config)?;
    let aggregator = Arc::new(Mutex::new(EventAggregator::new(
        config.viewer_queue_capacity,
    )));

    // The gateway subscribes first so it observes the stations' first status.
    let mut fleet = Fleet::new(broker, store, FleetSettings::from_config(&config));
    let started = fleet
        .start_gateway(Arc::clone(&aggregator))
        .map_err(AppError::from)
        .and_then(|()| start_simulation(&mut fleet, &config));
    stop_on_error(&mut fleet, started)?;

    let fleet: Arc<dyn FleetControl> = Arc::new(SharedFleet::new(fleet));
    let api_state = ApiState::new(
        aggregator,
        Arc::clone(&fleet),
        Duration::from_millis(config.viewer_idle_timeout_ms),
    );
    let http_bind = config.http_bind.clone();

    tracing::info!(bind = %http_bind, "http server starting");

    let server_result = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .wrap(Cors::permissive())
                .app_data(web::Data::new(api_state.clone()))
                .configure(configure_routes)
        })
        .bind(&http_bind)?
        .run()
        .await
    });

    tracing::info!("http server stopped; stopping actors");
    let stop_result = fleet.stop_all().map_err(AppError::from);

    server_result.map_err(AppError::runtime)?;
    stop_result
}

pub fn run_headless(config: AppConfig) -> Result<(), AppError> {
    let broker = InMemoryBroker::from_url(&config.bus_url).map_err(AppError::config)?;
    let store = open_store(&config)?;

    let mut fleet = Fleet::new(broker, store, FleetSettings::from_config(&config));
    let started = start_simulation(&mut fleet, &config);
    stop_on_error(&mut fleet, started)?;

    tracing::info!(
        stations = fleet.stations().len(),
        "headless fleet running; press Ctrl-C to stop"
    );

    let signal_result =
        actix_web::rt::System::new().block_on(async { actix_web::rt::signal::ctrl_c().await });

    tracing::info!("stopping actors");
    let stop_result = fleet.stop_all().map_err(AppError::from);

    signal_result.map_err(AppError::runtime)?;
    stop_result
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use crate::adapters::bus::{BusClient, BusConnector, ConnectOptions, InMemoryBroker};
    use crate::app::error::AppError;
    use crate::app::retry::RetryPolicy;
    use crate::domain::aggregator::EventAggregator;
    use crate::domain::models::OperationalState;
    use crate::domain::payload::{parse_status, parse_transaction};
    use crate::domain::station::{ChargingStation, OutboundMessage, SimulationSettings};
    use crate::domain::topics::TRANSACTIONS;
    use crate::test_support::RecordingStore;

    use super::{BillingActor, GatewayActor, StationActor, publish_all};

    const WAIT: Duration = Duration::from_millis(200);

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    fn idle_settings() -> SimulationSettings {
        SimulationSettings {
            arrival_probability: 0.0,
            completion_probability: 0.0,
        }
    }

    /// Publishes a station's outbound messages from a plain client, standing
    /// in for the station actor when a test needs exact timestamps.
    fn publish_as_station(client: &impl BusClient, messages: Vec<OutboundMessage>) {
        publish_all(client, &messages);
    }

    #[test]
    fn billed_session_is_published_and_persisted() {
        let broker = InMemoryBroker::new("billing-e2e");
        let store = RecordingStore::default();
        let mut billing = BillingActor::connect(&broker, 0.75, store.clone(), quick_retry())
            .expect("billing should connect");

        let listener = broker
            .connect(&ConnectOptions::new("listener"))
            .expect("listener should connect");
        listener
            .subscribe(TRANSACTIONS)
            .expect("subscribe should succeed");

        let publisher = broker
            .connect(&ConnectOptions::new("station-A-publisher"))
            .expect("publisher should connect");
        let mut station = ChargingStation::new("A");
        publish_as_station(
            &publisher,
            station.car_arrives("C1").expect("arrival should succeed"),
        );
        station.charge_tick(3.4).expect("tick should succeed");
        publish_as_station(
            &publisher,
            station.complete_charge().expect("completion should succeed"),
        );

        while billing.poll_once(WAIT).expect("poll should succeed") {}

        let inserted = store.inserted();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].car_id, "C1");
        assert_eq!(inserted[0].charger_id, "A");
        assert_eq!(inserted[0].energy_kwh, 3.4);
        assert_eq!(inserted[0].cost, 2.55);
        assert_eq!(inserted[0].logical_timestamp, 4);
        assert_eq!(billing.ledger().active_session_count(), 0);

        let published = listener
            .recv_timeout(WAIT)
            .expect("recv should succeed")
            .expect("transaction should be published");
        let transaction =
            parse_transaction(&published.payload).expect("transaction should parse");
        assert_eq!(transaction, inserted[0]);
    }

    #[test]
    fn storage_failure_still_publishes_transaction() {
        let broker = InMemoryBroker::new("billing-store-failure");
        let store = RecordingStore::failing();
        let mut billing = BillingActor::connect(&broker, 0.75, store.clone(), quick_retry())
            .expect("billing should connect");

        let listener = broker
            .connect(&ConnectOptions::new("listener"))
            .expect("listener should connect");
        listener
            .subscribe(TRANSACTIONS)
            .expect("subscribe should succeed");

        let publisher = broker
            .connect(&ConnectOptions::new("publisher"))
            .expect("publisher should connect");
        let mut station = ChargingStation::new("B");
        publish_as_station(&publisher, station.car_arrives("C9").expect("arrival"));
        station.charge_tick(2.0).expect("tick should succeed");
        publish_as_station(&publisher, station.complete_charge().expect("completion"));

        while billing.poll_once(WAIT).expect("poll should succeed") {}

        assert_eq!(store.attempts(), 1);
        assert!(store.inserted().is_empty());
        assert!(
            listener
                .recv_timeout(WAIT)
                .expect("recv should succeed")
                .is_some()
        );
    }

    #[test]
    fn orphan_end_is_not_billed() {
        let broker = InMemoryBroker::new("billing-orphan");
        let store = RecordingStore::default();
        let mut billing = BillingActor::connect(&broker, 0.75, store.clone(), quick_retry())
            .expect("billing should connect");
        let publisher = broker
            .connect(&ConnectOptions::new("publisher"))
            .expect("publisher should connect");

        publisher
            .publish(
                "charging/C/events",
                r#"{"actor_id":"C","action":"session_ended","car_id":"ghost","charger_id":"C","logical_timestamp":5,"energy_kwh":1.0}"#,
                false,
            )
            .expect("publish should succeed");

        assert!(billing.poll_once(WAIT).expect("poll should succeed"));
        assert_eq!(store.attempts(), 0);
        assert_eq!(billing.ledger().clock().current(), 6);
    }

    #[test]
    fn stations_merge_clocks_with_peer_events() {
        let broker = InMemoryBroker::new("station-peers");
        let mut station_a = StationActor::connect(
            &broker,
            "A",
            idle_settings(),
            Duration::from_secs(60),
            quick_retry(),
        )
        .expect("station A should connect");
        let publisher = broker
            .connect(&ConnectOptions::new("station-B-publisher"))
            .expect("publisher should connect");

        publisher
            .publish(
                "charging/B/events",
                r#"{"actor_id":"B","action":"session_started","car_id":"C2","charger_id":"B","logical_timestamp":5}"#,
                false,
            )
            .expect("publish should succeed");

        assert!(station_a.poll_once(WAIT).expect("poll should succeed"));
        assert_eq!(station_a.station().clock().current(), 6);
    }

    #[test]
    fn unclean_station_exit_marks_charger_offline() {
        let broker = InMemoryBroker::new("station-offline");
        let aggregator = Arc::new(Mutex::new(EventAggregator::new(8)));
        let mut gateway = GatewayActor::connect(&broker, Arc::clone(&aggregator), quick_retry())
            .expect("gateway should connect");

        let station = StationActor::connect(
            &broker,
            "A",
            idle_settings(),
            Duration::from_secs(60),
            quick_retry(),
        )
        .expect("station should connect");
        while gateway.poll_once(WAIT).expect("poll should succeed") {}
        {
            let snapshot = aggregator.lock().expect("aggregator lock").snapshot();
            assert_eq!(snapshot.chargers["A"].state, OperationalState::Free);
        }

        drop(station);
        while gateway.poll_once(WAIT).expect("poll should succeed") {}

        let snapshot = aggregator.lock().expect("aggregator lock").snapshot();
        assert_eq!(snapshot.chargers["A"].state, OperationalState::Offline);
        let retained = broker
            .retained("charging/A/status")
            .expect("broker lock")
            .expect("offline status should be retained");
        assert_eq!(
            parse_status(&retained).expect("status should parse").state,
            OperationalState::Offline
        );
    }

    #[test]
    fn shutdown_flushes_active_session_and_discards_will() {
        let broker = InMemoryBroker::new("station-shutdown");
        let listener = broker
            .connect(&ConnectOptions::new("listener"))
            .expect("listener should connect");
        listener
            .subscribe("charging/A/#")
            .expect("subscribe should succeed");

        let mut station = StationActor::connect(
            &broker,
            "A",
            SimulationSettings {
                arrival_probability: 1.0,
                completion_probability: 0.0,
            },
            Duration::from_secs(60),
            quick_retry(),
        )
        .expect("station should connect")
        .with_rng(StdRng::seed_from_u64(7));
        station.step();
        assert!(station.station().is_charging());

        station.shutdown().expect("shutdown should succeed");

        let mut topics = Vec::new();
        while let Some(message) = listener.recv_timeout(WAIT).expect("recv should succeed") {
            topics.push(message.topic);
        }
        assert_eq!(
            topics,
            vec![
                "charging/A/status",
                "charging/A/events",
                "charging/A/status",
                "charging/A/events",
                "charging/A/status",
            ]
        );

        let retained = broker
            .retained("charging/A/status")
            .expect("broker lock")
            .expect("final status should be retained");
        assert_eq!(
            parse_status(&retained).expect("status should parse").state,
            OperationalState::Free
        );
    }

    #[test]
    fn connect_fails_after_retry_budget() {
        let broker = InMemoryBroker::new("unreachable");
        broker
            .set_available(false)
            .expect("availability switch should work");

        let result = BillingActor::connect(
            &broker,
            0.75,
            RecordingStore::default(),
            RetryPolicy::new(2, Duration::from_millis(1)),
        );

        match result {
            Err(AppError::BusUnavailable {
                client_id,
                attempts,
                ..
            }) => {
                assert_eq!(client_id, "billing-service");
                assert_eq!(attempts, 2);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect should fail"),
        }
    }
}
