//! HTTP server for the Depot media lifecycle service.

pub mod auth;
pub mod cleanup;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::{AppState, CleanupTaskRegistry};
