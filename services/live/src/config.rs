use asc_live_core::SessionOptions;
use gemini_realtime::{LiveConfig, client};
use std::fmt;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub gemini_api_key: String,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub connect_timeout: Duration,
    pub pending_frame_capacity: usize,
    pub input_device: Option<String>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let endpoint = std::env::var("GEMINI_LIVE_ENDPOINT")
            .unwrap_or_else(|_| client::DEFAULT_ENDPOINT.to_string());
        let model =
            std::env::var("GEMINI_LIVE_MODEL").unwrap_or_else(|_| client::DEFAULT_MODEL.to_string());
        let voice =
            std::env::var("GEMINI_LIVE_VOICE").unwrap_or_else(|_| client::DEFAULT_VOICE.to_string());
        let system_instruction = std::env::var("SYSTEM_INSTRUCTION")
            .unwrap_or_else(|_| client::DEFAULT_SYSTEM_INSTRUCTION.to_string());

        let connect_timeout = Duration::from_secs(parse_positive("CONNECT_TIMEOUT_SECS", 15)?);
        let pending_frame_capacity = parse_positive("PENDING_FRAME_CAPACITY", 32)? as usize;

        let input_device = std::env::var("INPUT_DEVICE")
            .ok()
            .filter(|name| !name.trim().is_empty());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            gemini_api_key,
            endpoint,
            model,
            voice,
            system_instruction,
            connect_timeout,
            pending_frame_capacity,
            input_device,
            log_level,
        })
    }

    pub fn live_config(&self) -> LiveConfig {
        LiveConfig {
            api_key: self.gemini_api_key.clone(),
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            voice: self.voice.clone(),
            system_instruction: self.system_instruction.clone(),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            pending_frame_capacity: self.pending_frame_capacity,
            ..SessionOptions::default()
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("gemini_api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("connect_timeout", &self.connect_timeout)
            .field("pending_frame_capacity", &self.pending_frame_capacity)
            .field("input_device", &self.input_device)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn parse_positive(var: &str, default: u64) -> Result<u64, ConfigError> {
    let Ok(raw) = std::env::var(var) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::InvalidValue(
            var.to_string(),
            format!("'{}' is not a positive integer", raw),
        )),
    }
}
