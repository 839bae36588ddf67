//! The HTTP front-end: inbound chat endpoints, the count-tokens
//! passthrough, and the read-only metrics surface.

pub mod metrics;
pub mod proxy;

pub use metrics::api_router;
pub use proxy::{proxy_router, RouterState};
