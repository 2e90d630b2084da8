pub mod api;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod domain;
pub mod forecast;
pub mod hardware;
pub mod notify;
pub mod repo;
pub mod telemetry;
pub mod transport;
