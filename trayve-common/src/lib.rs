//! # Trayve Common Library
//!
//! Shared code for the Trayve services including:
//! - Error types
//! - Configuration loading and root folder resolution
//! - Event types (TrayveEvent enum) and the EventBus
//! - Server-Sent Events helpers
//! - Database schema initialization

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
