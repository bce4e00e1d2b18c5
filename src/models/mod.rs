pub mod exchange;
pub mod route;

pub use exchange::{Exchange, ExchangeRecord, ExchangeRequest, ExchangeResponse, HeaderList};
pub use route::{NewRoute, TenantRoute};
