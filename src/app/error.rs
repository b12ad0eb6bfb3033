use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to initialize database: {0}")]
    DatabaseInit(String),
    #[error("message bus unreachable for {client_id} after {attempts} attempts: {reason}")]
    BusUnavailable {
        client_id: String,
        attempts: u32,
        reason: String,
    },
    #[error("message bus error: {0}")]
    Bus(String),
    #[error("runtime failure: {0}")]
    Runtime(String),
}

impl AppError {
    pub fn logging_init<E: std::fmt::Display>(error: E) -> Self {
        Self::LoggingInit(error.to_string())
    }

    pub fn config<E: std::fmt::Display>(error: E) -> Self {
        Self::Config(error.to_string())
    }

    pub fn database_init<E: std::fmt::Display>(error: E) -> Self {
        Self::DatabaseInit(error.to_string())
    }

    pub fn bus<E: std::fmt::Display>(error: E) -> Self {
        Self::Bus(error.to_string())
    }

    pub fn runtime<E: std::fmt::Display>(error: E) -> Self {
        Self::Runtime(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn maps_logging_init_error_message() {
        let err = AppError::logging_init("subscriber already set");
        assert_eq!(
            err.to_string(),
            "failed to initialize logging: subscriber already set"
        );
    }

    #[test]
    fn bus_exhaustion_names_client_and_attempts() {
        let err = AppError::BusUnavailable {
            client_id: "billing-service".to_string(),
            attempts: 5,
            reason: "message bus fleet is unavailable".to_string(),
        };

        assert_eq!(
            err.to_string(),
            "message bus unreachable for billing-service after 5 attempts: message bus fleet is unavailable"
        );
    }
}
