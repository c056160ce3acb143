pub mod audio;
pub mod config;
pub mod events;
pub mod handlers;
pub mod logger;
pub mod routes;
pub mod session;
pub mod state;
pub mod synth;

// Re-export commonly used items for convenience
pub use config::ServerConfig;
pub use state::AppState;
