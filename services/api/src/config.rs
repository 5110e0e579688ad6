use callbridge_core::{audio::AudioEncoding, relay::RelaySettings, turn::TurnDetection};
use secrecy::SecretString;
use std::{fmt::Display, net::SocketAddr, str::FromStr, time::Duration};
use tracing::Level;

const DEFAULT_PORT: u16 = 10000;
const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

const DEFAULT_INSTRUCTIONS: &str = "Du är AiQ, en varm, mjuk och lugn svensk AI-assistent. \
    Prata som en vanlig mänsklig vän: lugnt tempo, varm ton, enkla meningar och naturliga pauser. \
    Svara kort men levande. Om personen är tyst, fråga mjukt om den är kvar.";
const DEFAULT_GREETING: &str = "Hej. Mitt namn är AiQ. Hur kan jag hjälpa dig i dag?";
const DEFAULT_GREETING_FOLLOWUP: &str = "Hallå. Hör du mig?";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// What the telephony provider says before it opens the media stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Greeting {
    pub text: String,
    pub followup: String,
    pub language: String,
    pub voice: String,
    pub pause_secs: u32,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: SecretString,
    pub realtime_url: String,
    pub realtime_model: String,
    pub voice: String,
    pub audio_format: AudioEncoding,
    pub turn_detection: TurnDetection,
    pub speech_energy_threshold: f64,
    pub readiness_buffer: Duration,
    pub instructions: String,
    pub greeting: Greeting,
    pub public_host: Option<String>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = match std::env::var("BIND_ADDRESS") {
            Ok(addr) => parse_value("BIND_ADDRESS", &addr)?,
            Err(_) => {
                let port: u16 = parse_var("PORT", DEFAULT_PORT)?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let realtime_url = var_or("REALTIME_URL", DEFAULT_REALTIME_URL);
        let realtime_model = var_or("REALTIME_MODEL", DEFAULT_REALTIME_MODEL);
        let voice = var_or("REALTIME_VOICE", "verse");
        let audio_format: AudioEncoding = parse_var("AUDIO_FORMAT", AudioEncoding::Pcmu)?;

        let silence_ms: u64 = parse_var("SILENCE_THRESHOLD_MS", 1000)?;
        let turn_detection = match var_or("TURN_DETECTION", "server_vad").to_lowercase().as_str() {
            "server_vad" | "server" => TurnDetection::ServerVad,
            "local" | "silence" => TurnDetection::LocalSilence {
                threshold: Duration::from_millis(silence_ms),
            },
            other => {
                return Err(ConfigError::InvalidValue(
                    "TURN_DETECTION".to_string(),
                    format!("'{}' is not one of 'server_vad', 'local'", other),
                ));
            }
        };
        let speech_energy_threshold: f64 = parse_var("SPEECH_ENERGY_THRESHOLD", 500.0)?;
        let readiness_buffer =
            Duration::from_millis(parse_var("READINESS_BUFFER_MS", 5000u64)?);

        let instructions = var_or("INSTRUCTIONS", DEFAULT_INSTRUCTIONS);
        let greeting = Greeting {
            text: var_or("GREETING", DEFAULT_GREETING),
            followup: var_or("GREETING_FOLLOWUP", DEFAULT_GREETING_FOLLOWUP),
            language: var_or("GREETING_LANGUAGE", "sv-SE"),
            voice: var_or("GREETING_VOICE", "alice"),
            pause_secs: parse_var("GREETING_PAUSE_SECS", 5)?,
        };
        let public_host = std::env::var("PUBLIC_HOST").ok().filter(|h| !h.is_empty());

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
            voice,
            audio_format,
            turn_detection,
            speech_energy_threshold,
            readiness_buffer,
            instructions,
            greeting,
            public_host,
            log_level,
        })
    }

    /// Full model endpoint including the model query parameter.
    pub fn realtime_endpoint(&self) -> String {
        let separator = if self.realtime_url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.realtime_url, separator, self.realtime_model)
    }

    /// Per-call relay settings.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            encoding: self.audio_format,
            detection: self.turn_detection,
            speech_energy_threshold: self.speech_energy_threshold,
            readiness_cap: self.readiness_buffer,
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => parse_value(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}
