//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{
    ConfigError, ConversationConfig, IngressConfig, PlayoutConfig, RealtimeConfig,
    TelephonyConfig,
};

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Telephony transport
    #[serde(default)]
    pub telephony: TelephonyConfig,

    /// Caller audio conditioning
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Agent audio playout
    #[serde(default)]
    pub playout: PlayoutConfig,

    /// Speech service connection
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Turn-taking and call lifecycle
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.realtime.sample_rate, 16000 | 24000) {
            return Err(ConfigError::invalid(
                "realtime.sample_rate",
                format!("{} Hz is not supported (use 16000 or 24000)", self.realtime.sample_rate),
            ));
        }

        let playout = &self.playout;
        if playout.cold_start_frames == 0 || playout.resume_frames == 0 {
            return Err(ConfigError::invalid(
                "playout",
                "buffering thresholds must be at least one frame",
            ));
        }
        if playout.resume_frames > playout.cold_start_frames {
            return Err(ConfigError::invalid(
                "playout.resume_frames",
                "resume threshold cannot exceed the cold start threshold",
            ));
        }
        if playout.cold_start_frames > playout.max_queue_frames {
            return Err(ConfigError::invalid(
                "playout.cold_start_frames",
                "cold start threshold cannot exceed the queue capacity",
            ));
        }
        if !(1..=1000).contains(&playout.breaker_threshold) {
            return Err(ConfigError::invalid(
                "playout.breaker_threshold",
                "must be between 1 and 1000",
            ));
        }

        let ingress = &self.ingress;
        if ingress.gate_close_rms > ingress.gate_open_rms {
            return Err(ConfigError::invalid(
                "ingress.gate_close_rms",
                "close threshold must not exceed the open threshold",
            ));
        }
        if ingress.agc_min_gain > ingress.agc_max_gain {
            return Err(ConfigError::invalid(
                "ingress.agc_min_gain",
                "minimum gain must not exceed maximum gain",
            ));
        }
        if ingress.min_fill == 0 {
            return Err(ConfigError::invalid("ingress.min_fill", "must be at least 1"));
        }

        if self.realtime.api_key.is_none() {
            tracing::warn!("realtime.api_key is not set; the service may reject the connection");
        }

        Ok(())
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,

    /// Enable metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_true() -> bool {
    true
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
        }
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (VOICE_BRIDGE_ prefix)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder = builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("VOICE_BRIDGE")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
