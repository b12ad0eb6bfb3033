mod config;
mod error;
mod logging;
pub mod fleet;
pub mod retry;
pub mod runtime;
pub mod services;

pub use config::AppConfig;
pub use error::AppError;

fn bootstrap() -> Result<AppConfig, AppError> {
    logging::init()?;

    let config = AppConfig::from_env()?;

    tracing::info!(
        bus_url = %config.bus_url,
        db_path = %config.db_path,
        stations = %config.station_ids.join(","),
        rate_per_kwh = config.rate_per_kwh,
        tick_interval_ms = config.tick_interval_ms,
        arrival_probability = config.arrival_probability,
        completion_probability = config.completion_probability,
        http_bind = %config.http_bind,
        "application bootstrap initialized"
    );

    Ok(config)
}

/// Broker, stations, billing and the HTTP gateway in one process.
pub fn run() -> Result<(), AppError> {
    runtime::run(bootstrap()?)
}

/// Stations and billing only, until interrupted.
pub fn run_headless() -> Result<(), AppError> {
    runtime::run_headless(bootstrap()?)
}
