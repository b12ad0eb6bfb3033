use std::collections::HashSet;

use crate::app::AppError;
use crate::domain::topics::is_valid_station_id;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bus_url: String,
    pub db_path: String,
    pub station_ids: Vec<String>,
    pub rate_per_kwh: f64,
    pub tick_interval_ms: u64,
    pub arrival_probability: f64,
    pub completion_probability: f64,
    pub bus_connect_attempts: u32,
    pub bus_retry_delay_ms: u64,
    pub http_bind: String,
    pub viewer_queue_capacity: usize,
    pub viewer_idle_timeout_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        // A missing .env file is normal; real environment variables still apply.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bus_url = required(&lookup, "BUS_URL")?;
        let db_path = required(&lookup, "DB_PATH")?;

        let station_ids = parse_station_ids(
            &lookup("STATION_IDS")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "A,B,C".to_string()),
        )?;

        let rate_per_kwh = parse_or_default(&lookup, "RATE_PER_KWH", 0.75_f64)?;
        if !rate_per_kwh.is_finite() || rate_per_kwh < 0.0 {
            return Err(AppError::config("RATE_PER_KWH must be a non-negative number"));
        }

        let bus_connect_attempts = parse_or_default(&lookup, "BUS_CONNECT_ATTEMPTS", 5_u32)?;
        if bus_connect_attempts == 0 {
            return Err(AppError::config("BUS_CONNECT_ATTEMPTS must be at least 1"));
        }

        let tick_interval_ms = parse_or_default(&lookup, "TICK_INTERVAL_MS", 5000_u64)?;
        if tick_interval_ms == 0 {
            return Err(AppError::config("TICK_INTERVAL_MS must be at least 1"));
        }

        Ok(Self {
            bus_url,
            db_path,
            station_ids,
            rate_per_kwh,
            tick_interval_ms,
            arrival_probability: parse_probability(&lookup, "ARRIVAL_PROBABILITY", 0.3)?,
            completion_probability: parse_probability(&lookup, "COMPLETION_PROBABILITY", 0.2)?,
            bus_connect_attempts,
            bus_retry_delay_ms: parse_or_default(&lookup, "BUS_RETRY_DELAY_MS", 5000_u64)?,
            http_bind: lookup("HTTP_BIND")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            viewer_queue_capacity: parse_or_default(&lookup, "VIEWER_QUEUE_CAPACITY", 64_usize)?
                .max(1),
            viewer_idle_timeout_ms: parse_or_default(
                &lookup,
                "VIEWER_IDLE_TIMEOUT_MS",
                60_000_u64,
            )?
            .max(1),
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::config(format!("{key} is required")))
}

fn parse_station_ids(raw: &str) -> Result<Vec<String>, AppError> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();

    for id in raw.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !is_valid_station_id(id) {
            return Err(AppError::config(format!(
                "STATION_IDS entry '{id}' must not contain '/', '+' or '#'"
            )));
        }
        if !seen.insert(id.to_string()) {
            return Err(AppError::config(format!(
                "STATION_IDS contains duplicate entry '{id}'"
            )));
        }
        ids.push(id.to_string());
    }

    if ids.is_empty() {
        return Err(AppError::config("STATION_IDS must name at least one station"));
    }

    Ok(ids)
}

fn parse_probability<F>(lookup: &F, key: &str, default: f64) -> Result<f64, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or_default(lookup, key, default)?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(AppError::config(format!("{key} must be between 0 and 1")))
    }
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    fn base(key: &str) -> Option<String> {
        match key {
            "BUS_URL" => Some("memory://fleet".to_string()),
            "DB_PATH" => Some("/tmp/billing.db".to_string()),
            _ => None,
        }
    }

    #[test]
    fn rejects_missing_bus_url() {
        let result = AppConfig::from_lookup(|key| match key {
            "DB_PATH" => Some("/tmp/billing.db".to_string()),
            _ => None,
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: BUS_URL is required"
        );
    }

    #[test]
    fn rejects_missing_db_path() {
        let result = AppConfig::from_lookup(|key| match key {
            "BUS_URL" => Some("memory://fleet".to_string()),
            _ => None,
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: DB_PATH is required"
        );
    }

    #[test]
    fn applies_defaults_for_optional_fields() {
        let result = AppConfig::from_lookup(base).expect("config should be valid");

        assert_eq!(result.bus_url, "memory://fleet");
        assert_eq!(result.station_ids, vec!["A", "B", "C"]);
        assert_eq!(result.rate_per_kwh, 0.75);
        assert_eq!(result.tick_interval_ms, 5000);
        assert_eq!(result.arrival_probability, 0.3);
        assert_eq!(result.completion_probability, 0.2);
        assert_eq!(result.bus_connect_attempts, 5);
        assert_eq!(result.bus_retry_delay_ms, 5000);
        assert_eq!(result.http_bind, "0.0.0.0:8080");
        assert_eq!(result.viewer_queue_capacity, 64);
        assert_eq!(result.viewer_idle_timeout_ms, 60_000);
    }

    #[test]
    fn parses_station_list_with_whitespace() {
        let result = AppConfig::from_lookup(|key| match key {
            "STATION_IDS" => Some(" north , south,, east ".to_string()),
            other => base(other),
        })
        .expect("config should be valid");

        assert_eq!(result.station_ids, vec!["north", "south", "east"]);
    }

    #[test]
    fn rejects_duplicate_and_wildcard_station_ids() {
        let duplicate = AppConfig::from_lookup(|key| match key {
            "STATION_IDS" => Some("A,B,A".to_string()),
            other => base(other),
        });
        assert_eq!(
            duplicate.unwrap_err().to_string(),
            "invalid configuration: STATION_IDS contains duplicate entry 'A'"
        );

        let wildcard = AppConfig::from_lookup(|key| match key {
            "STATION_IDS" => Some("A,+".to_string()),
            other => base(other),
        });
        assert!(wildcard.is_err());
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let result = AppConfig::from_lookup(|key| match key {
            "TICK_INTERVAL_MS" => Some("abc".to_string()),
            other => base(other),
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: TICK_INTERVAL_MS must be a valid number"
        );
    }

    #[test]
    fn rejects_probability_out_of_range() {
        let result = AppConfig::from_lookup(|key| match key {
            "ARRIVAL_PROBABILITY" => Some("1.5".to_string()),
            other => base(other),
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: ARRIVAL_PROBABILITY must be between 0 and 1"
        );
    }

    #[test]
    fn rejects_zero_connect_attempts_and_negative_rate() {
        let attempts = AppConfig::from_lookup(|key| match key {
            "BUS_CONNECT_ATTEMPTS" => Some("0".to_string()),
            other => base(other),
        });
        assert!(attempts.is_err());

        let rate = AppConfig::from_lookup(|key| match key {
            "RATE_PER_KWH" => Some("-1".to_string()),
            other => base(other),
        });
        assert!(rate.is_err());
    }
}
