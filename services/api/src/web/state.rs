//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use bedtales_core::library::StoryLibrary;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub library: Arc<StoryLibrary>,
    pub config: Arc<Config>,
}
