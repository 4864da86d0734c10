// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod scheduler;
pub mod store;
pub mod strategy;

// Re-export commonly used types
pub use error::EngineError;
pub use models::*;
pub use strategy::SignalEngine;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
