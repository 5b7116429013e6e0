//! HTTP handlers for banking-service.
//!
//! The only browser-facing route is the OAuth callback; the rest are probes.

pub mod callback;
pub mod health;

pub use callback::oauth_callback;
pub use health::{health_check, metrics_handler, readiness_check};
