pub mod rest;
pub mod state;
pub mod sweeper;

pub use rest::ApiDoc;
pub use state::AppState;
pub use sweeper::spawn_history_sweeper;
