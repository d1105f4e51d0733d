use relay_core::realtime::TurnDetectionSettings;
use secrecy::SecretString;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";
pub const DEFAULT_GREETING_DELAY_MS: u64 = 500;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Credential for the upstream API. Checked per session, not at startup.
    pub openai_api_key: Option<SecretString>,
    pub realtime_url: String,
    pub realtime_model: String,
    pub turn_detection: TurnDetectionSettings,
    pub greeting_delay: Duration,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            openai_api_key: None,
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            realtime_model: DEFAULT_REALTIME_MODEL.to_string(),
            turn_detection: TurnDetectionSettings::default(),
            greeting_delay: Duration::from_millis(DEFAULT_GREETING_DELAY_MS),
            log_level: Level::INFO,
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        let defaults = Config::default();

        let bind_address = match parse_var::<SocketAddr>("BIND_ADDRESS")? {
            Some(addr) => addr,
            None => {
                let port = parse_var::<u16>("PORT")?.unwrap_or(DEFAULT_PORT);
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);

        let realtime_url =
            std::env::var("REALTIME_URL").unwrap_or_else(|_| DEFAULT_REALTIME_URL.to_string());
        let realtime_model =
            std::env::var("REALTIME_MODEL").unwrap_or_else(|_| DEFAULT_REALTIME_MODEL.to_string());

        let threshold =
            parse_var::<f32>("VAD_THRESHOLD")?.unwrap_or(defaults.turn_detection.threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidValue(
                "VAD_THRESHOLD".to_string(),
                format!("{threshold} is outside [0, 1]"),
            ));
        }
        let turn_detection = TurnDetectionSettings {
            threshold,
            prefix_padding_ms: parse_var("VAD_PREFIX_PADDING_MS")?
                .unwrap_or(defaults.turn_detection.prefix_padding_ms),
            silence_duration_ms: parse_var("VAD_SILENCE_DURATION_MS")?
                .unwrap_or(defaults.turn_detection.silence_duration_ms),
        };

        let greeting_delay = Duration::from_millis(
            parse_var("GREETING_DELAY_MS")?.unwrap_or(DEFAULT_GREETING_DELAY_MS),
        );

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_url,
            realtime_model,
            turn_detection,
            greeting_delay,
            log_level,
        })
    }

    /// Full upstream endpoint including the model query parameter.
    pub fn realtime_endpoint(&self) -> String {
        let separator = if self.realtime_url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.realtime_url, separator, self.realtime_model)
    }
}
