use std::collections::HashMap;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix_web::{HttpResponse, Responder, delete, get, post, web};
use serde::{Deserialize, Serialize};

use crate::app::fleet::{FleetControl, FleetError};
use crate::domain::aggregator::{Envelope, EventAggregator, Snapshot, ViewerId};

const DEFAULT_FEED_BATCH: usize = 100;
const MAX_FEED_BATCH: usize = 1000;

/// A registered viewer's queue and the last time it was read.
pub struct ViewerFeed {
    receiver: Receiver<Envelope>,
    last_polled: Instant,
}

impl ViewerFeed {
    fn new(receiver: Receiver<Envelope>) -> Self {
        Self {
            receiver,
            last_polled: Instant::now(),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub aggregator: Arc<Mutex<EventAggregator>>,
    pub feeds: Arc<Mutex<HashMap<ViewerId, ViewerFeed>>>,
    pub fleet: Arc<dyn FleetControl>,
    pub viewer_idle_timeout: Duration,
}

impl ApiState {
    pub fn new(
        aggregator: Arc<Mutex<EventAggregator>>,
        fleet: Arc<dyn FleetControl>,
        viewer_idle_timeout: Duration,
    ) -> Self {
        Self {
            aggregator,
            feeds: Arc::new(Mutex::new(HashMap::new())),
            fleet,
            viewer_idle_timeout,
        }
    }

    /// Drops viewers that have not polled within the idle timeout, from both
    /// the feed map and the aggregator. Returns how many were removed.
    fn sweep_idle_viewers(&self, feeds: &mut HashMap<ViewerId, ViewerFeed>) -> usize {
        let idle: Vec<ViewerId> = feeds
            .iter()
            .filter(|(_, feed)| feed.last_polled.elapsed() >= self.viewer_idle_timeout)
            .map(|(id, _)| *id)
            .collect();
        if idle.is_empty() {
            return 0;
        }

        let mut aggregator = self.aggregator.lock().ok();
        for id in &idle {
            feeds.remove(id);
            if let Some(aggregator) = aggregator.as_mut() {
                aggregator.disconnect_viewer(*id);
            }
            tracing::info!(viewer_id = %id, "idle viewer expired");
        }
        idle.len()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRegisteredResponse {
    pub viewer_id: String,
    pub snapshot: Snapshot,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub viewer_id: String,
    pub envelopes: Vec<Envelope>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StationResponse {
    pub station_id: String,
    pub running: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingStatusResponse {
    pub running: bool,
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub max: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStationRequest {
    pub station_id: String,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(get_state_endpoint)
        .service(register_viewer_endpoint)
        .service(viewer_feed_endpoint)
        .service(disconnect_viewer_endpoint)
        .service(list_stations_endpoint)
        .service(start_station_endpoint)
        .service(stop_station_endpoint)
        .service(billing_status_endpoint)
        .service(start_billing_endpoint)
        .service(stop_billing_endpoint);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[get("/api/state")]
async fn get_state_endpoint(state: web::Data<ApiState>) -> impl Responder {
    match state.aggregator.lock() {
        Ok(aggregator) => HttpResponse::Ok().json(aggregator.snapshot()),
        Err(_) => lock_poisoned_response("aggregator"),
    }
}

#[post("/api/viewers")]
async fn register_viewer_endpoint(state: web::Data<ApiState>) -> impl Responder {
    let connection = match state.aggregator.lock() {
        Ok(mut aggregator) => aggregator.connect_viewer(),
        Err(_) => return lock_poisoned_response("aggregator"),
    };

    match state.feeds.lock() {
        Ok(mut feeds) => {
            state.sweep_idle_viewers(&mut feeds);
            feeds.insert(connection.id, ViewerFeed::new(connection.feed));
        }
        Err(_) => return lock_poisoned_response("viewer feeds"),
    }

    tracing::info!(viewer_id = %connection.id, "viewer connected");

    HttpResponse::Created().json(ViewerRegisteredResponse {
        viewer_id: connection.id.to_string(),
        snapshot: connection.snapshot,
    })
}

#[get("/api/viewers/{id}/feed")]
async fn viewer_feed_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    query: web::Query<FeedQuery>,
) -> impl Responder {
    let Ok(viewer_id) = path.parse::<ViewerId>() else {
        return invalid_viewer_id_response();
    };
    let max = query
        .max
        .unwrap_or(DEFAULT_FEED_BATCH)
        .clamp(1, MAX_FEED_BATCH);

    let mut feeds = match state.feeds.lock() {
        Ok(feeds) => feeds,
        Err(_) => return lock_poisoned_response("viewer feeds"),
    };
    state.sweep_idle_viewers(&mut feeds);
    let Some(feed) = feeds.get_mut(&viewer_id) else {
        return viewer_not_found_response();
    };
    feed.last_polled = Instant::now();

    let mut envelopes = Vec::new();
    let mut hung_up = false;
    while envelopes.len() < max {
        match feed.receiver.try_recv() {
            Ok(envelope) => envelopes.push(envelope),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                hung_up = true;
                break;
            }
        }
    }

    if hung_up && envelopes.is_empty() {
        feeds.remove(&viewer_id);
        return viewer_not_found_response();
    }

    HttpResponse::Ok().json(FeedResponse {
        viewer_id: viewer_id.to_string(),
        envelopes,
    })
}

#[delete("/api/viewers/{id}")]
async fn disconnect_viewer_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> impl Responder {
    let Ok(viewer_id) = path.parse::<ViewerId>() else {
        return invalid_viewer_id_response();
    };

    let removed_feed = match state.feeds.lock() {
        Ok(mut feeds) => feeds.remove(&viewer_id).is_some(),
        Err(_) => return lock_poisoned_response("viewer feeds"),
    };
    let removed_viewer = match state.aggregator.lock() {
        Ok(mut aggregator) => aggregator.disconnect_viewer(viewer_id),
        Err(_) => return lock_poisoned_response("aggregator"),
    };

    if removed_feed || removed_viewer {
        tracing::info!(viewer_id = %viewer_id, "viewer disconnected");
        HttpResponse::NoContent().finish()
    } else {
        viewer_not_found_response()
    }
}

#[get("/api/stations")]
async fn list_stations_endpoint(state: web::Data<ApiState>) -> impl Responder {
    match state.fleet.stations() {
        Ok(stations) => HttpResponse::Ok().json(
            stations
                .into_iter()
                .map(|station| StationResponse {
                    station_id: station.name,
                    running: station.running,
                })
                .collect::<Vec<_>>(),
        ),
        Err(error) => fleet_error_response(&error),
    }
}

#[post("/api/stations")]
async fn start_station_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<StartStationRequest>,
) -> impl Responder {
    let station_id = body.into_inner().station_id.trim().to_string();
    let fleet = Arc::clone(&state.fleet);
    let requested = station_id.clone();

    match run_fleet_op(move || fleet.start_station(&requested)).await {
        Ok(()) => {
            tracing::info!(station_id = %station_id, "station started on request");
            HttpResponse::Created().json(StationResponse {
                station_id,
                running: true,
            })
        }
        Err(response) => response,
    }
}

#[delete("/api/stations/{id}")]
async fn stop_station_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> impl Responder {
    let station_id = path.into_inner();
    let fleet = Arc::clone(&state.fleet);

    match run_fleet_op(move || fleet.stop_station(&station_id)).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(response) => response,
    }
}

#[get("/api/billing")]
async fn billing_status_endpoint(state: web::Data<ApiState>) -> impl Responder {
    match state.fleet.billing_running() {
        Ok(running) => HttpResponse::Ok().json(BillingStatusResponse { running }),
        Err(error) => fleet_error_response(&error),
    }
}

#[post("/api/billing/start")]
async fn start_billing_endpoint(state: web::Data<ApiState>) -> impl Responder {
    let fleet = Arc::clone(&state.fleet);
    match run_fleet_op(move || fleet.start_billing()).await {
        Ok(()) => {
            tracing::info!("billing started on request");
            HttpResponse::Created().json(BillingStatusResponse { running: true })
        }
        Err(response) => response,
    }
}

#[post("/api/billing/stop")]
async fn stop_billing_endpoint(state: web::Data<ApiState>) -> impl Responder {
    let fleet = Arc::clone(&state.fleet);
    match run_fleet_op(move || fleet.stop_billing()).await {
        Ok(()) => {
            tracing::info!("billing stopped on request");
            HttpResponse::NoContent().finish()
        }
        Err(response) => response,
    }
}

/// Starting retries the bus connect and stopping joins a thread, so fleet
/// control runs on the blocking pool.
async fn run_fleet_op<F>(op: F) -> Result<(), HttpResponse>
where
    F: FnOnce() -> Result<(), FleetError> + Send + 'static,
{
    match web::block(op).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(fleet_error_response(&error)),
        Err(error) => Err(HttpResponse::InternalServerError().json(serde_json::json!({
            "error": error.to_string()
        }))),
    }
}

fn fleet_error_response(error: &FleetError) -> HttpResponse {
    let body = serde_json::json!({ "error": error.to_string() });
    match error {
        FleetError::InvalidStationId(_) => HttpResponse::BadRequest().json(body),
        FleetError::AlreadyRunning(_) => HttpResponse::Conflict().json(body),
        FleetError::NotRunning(_) => HttpResponse::NotFound().json(body),
        FleetError::Startup { .. } => HttpResponse::ServiceUnavailable().json(body),
        FleetError::Panicked(_) | FleetError::LockPoisoned => {
            tracing::error!(error = %error, "fleet control failed");
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn lock_poisoned_response(what: &str) -> HttpResponse {
    HttpResponse::InternalServerError().json(serde_json::json!({
        "error": format!("{what} lock poisoned")
    }))
}

fn invalid_viewer_id_response() -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({
        "error": "viewer id must be a uuid"
    }))
}

fn viewer_not_found_response() -> HttpResponse {
    HttpResponse::NotFound().json(serde_json::json!({
        "error": "viewer not connected"
    }))
}
