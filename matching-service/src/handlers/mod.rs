//! HTTP handlers for matching-service.

pub mod extract;
pub mod groups;
pub mod health;
pub mod matching;

pub use health::{health_check, metrics_handler, readiness_check};
