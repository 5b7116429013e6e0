//! Banking Service - open banking provider links and account synchronization.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod security;
pub mod services;
pub mod startup;
pub mod workers;

pub use startup::AppState;
