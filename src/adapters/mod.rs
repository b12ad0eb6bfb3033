pub mod api;
pub mod bus;
pub mod db;
