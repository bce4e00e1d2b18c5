//! The hot path: route resolution, origin relay and telemetry hand-off

pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod ip_extractor;
pub mod routes;

pub use error::ProxyError;
pub use forwarder::{Forwarder, UpstreamResponse};
pub use handlers::ProxyState;
pub use routes::create_proxy_router;
