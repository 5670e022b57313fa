//! HTTP surface: the rate limit middleware and the admission service.

pub mod middleware;
mod server;
mod service;

pub use middleware::{enforce, guard, IdentitySource, RouteGuard};
pub use server::HttpServer;
pub use service::{router, AppState};
