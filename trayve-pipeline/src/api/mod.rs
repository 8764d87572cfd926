//! HTTP API handlers for trayve-pipeline
//!
//! JSON REST endpoints for starting, polling and cancelling executions, the
//! credit balance, and an SSE side-channel over the same state.

pub mod credits;
pub mod executions;
pub mod health;
pub mod projects;
pub mod sse;

pub use credits::credit_routes;
pub use executions::execution_routes;
pub use health::health_routes;
pub use projects::project_routes;
pub use sse::event_stream;
