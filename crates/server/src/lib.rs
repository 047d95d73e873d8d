//! Quire HTTP gateway.
//!
//! Serves the upload API, the task API and its server-sent progress
//! stream over the engine in `quire-engine`.

pub mod error;
pub mod handlers;
pub mod maintenance;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
