//! Service configuration, loaded from environment variables.

use std::env;
use tracing::Level;

/// Capacity of the inbound session event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Capacity of the outbound message channel feeding the writer task.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub google_api_key: String,
    pub chat_model: String,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `GOOGLE_API_KEY`: Key used for Gemini, Speech-to-Text and Text-to-Speech. Required.
    // *   `CHAT_MODEL`: (Optional) The Gemini model used for the persona chat and the coach. Defaults to "gemini-3-pro-preview".
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO". Can be "TRACE", "DEBUG", "INFO", "WARN", or "ERROR".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();

        let google_api_key = env::var("GOOGLE_API_KEY")
            .map_err(|_| ConfigError::MissingVar("GOOGLE_API_KEY".to_string()))?;

        // Provide a default for non-critical variables.
        let chat_model =
            env::var("CHAT_MODEL").unwrap_or_else(|_| "gemini-3-pro-preview".to_string());

        // Configure logging level from RUST_LOG, with a sensible default.
        let log_level_str = env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            google_api_key,
            chat_model,
            log_level,
        })
    }
}
