//! Configuration management for the voice bridge
//!
//! Supports loading configuration from:
//! - YAML files (`config/default.yaml`, `config/{env}.yaml`)
//! - Environment variables (VOICE_BRIDGE_ prefix, `__` separator)

pub mod media;
pub mod realtime;
pub mod settings;

pub use media::{IngressConfig, PlayoutConfig, ResamplerKind, TelephonyConfig, TransportAdapter};
pub use realtime::{ConversationConfig, Dialect, RealtimeConfig};
pub use settings::{load_settings, ObservabilityConfig, Settings};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
