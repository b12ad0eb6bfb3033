pub mod aggregator;
pub mod billing;
pub mod logical_clock;
pub mod models;
pub mod payload;
pub mod station;
pub mod topics;
