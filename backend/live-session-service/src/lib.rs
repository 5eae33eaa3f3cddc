//! Live Session Service
//!
//! Orchestrates live broadcasts: stream keys and session lifecycle, media
//! ingest, transcode dispatch, segment publishing, and the per-channel chat
//! with moderation and presence.

pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Public re-exports
pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
