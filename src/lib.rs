pub mod analytics;
pub mod config;
pub mod models;
pub mod proxy;
pub mod security;
pub mod storage;
pub mod telemetry;
