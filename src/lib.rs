//! Lumen Library
//!
//! This library contains all the core modules for the Lumen feed
//! aggregator: ingestion, summarization, scheduling, personalization, and
//! the HTTP API.

use sqlx::SqlitePool;
use std::sync::Arc;

pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use services::{
    AppSettingsService, IngestionService, Scheduler, SuggestionService, SummarizerClient,
    SummaryWorker, UserProfileService,
};
pub use utils::JwtUtil;

#[cfg(test)]
mod tests;

/// Application shared state
///
/// Design Philosophy: Keep it simple - Rust's type system IS our DI container.
/// All services are wrapped in Arc for cheap cloning and thread safety.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Config,

    pub jwt_util: Arc<JwtUtil>,
    pub settings: AppSettingsService,

    pub ingestion: Arc<IngestionService>,
    pub summarizer: Arc<SummarizerClient>,
    pub worker: Arc<SummaryWorker>,
    pub profile_service: UserProfileService,
    pub suggestion_service: SuggestionService,
    pub scheduler: Arc<Scheduler>,
}
