//! Circulation server
//!
//! Loan lifecycle of a lending library: admission control for new loans, returns
//! with late fees and borrowing bans, fee settlement, and the nightly
//! reconciliation jobs (overdue fees, due-date reminders).

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<services::Services>,
}
