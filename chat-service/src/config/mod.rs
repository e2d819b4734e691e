use crate::relay::StreamProtocol;
use crate::services::providers::gemini::GEMINI_API_BASE;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_SERVICE_NAME: &str = "Pet Care AI API";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Default system instruction for the veterinary assistant deployment.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a pet care veterinary assistant. \
Based on the symptoms and any other description of the pet, work out which illness \
the pet most likely has and suggest what the owner should do next.";

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub common: core_config::Config,
    pub google: GoogleConfig,
    pub models: ModelConfig,
    pub relay: RelayConfig,
}

#[derive(Clone)]
pub struct GoogleConfig {
    pub api_key: String,
    pub api_base: String,
}

impl std::fmt::Debug for GoogleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleConfig")
            .field("api_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Model for streamed text (e.g., gemini-2.5-flash)
    pub text_model: String,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub protocol: StreamProtocol,
    pub system_instruction: String,
    /// Name reported by `GET /`
    pub service_name: String,
    /// Upper bound on the wait for each upstream event
    pub idle_timeout: Duration,
    pub provider: ProviderKind,
}

/// Which upstream backend serves generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    Mock,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(ProviderKind::Gemini),
            "mock" => Ok(ProviderKind::Mock),
            other => Err(format!(
                "unknown provider '{}' (expected 'gemini' or 'mock')",
                other
            )),
        }
    }
}

impl ChatConfig {
    /// Load from the process environment (after `.env`).
    ///
    /// A missing or empty `GEMINI_API_KEY` is an error: the service must not
    /// start without a credential.
    pub fn load() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let idle_timeout_secs: u64 = parse_env(
            &lookup,
            "CHAT_STREAM_IDLE_TIMEOUT_SECS",
            DEFAULT_IDLE_TIMEOUT_SECS,
        )?;
        if idle_timeout_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CHAT_STREAM_IDLE_TIMEOUT_SECS must be greater than zero"
            )));
        }

        Ok(ChatConfig {
            common,
            google: GoogleConfig {
                api_key: get_env(&lookup, "GEMINI_API_KEY", None)?,
                api_base: get_env(&lookup, "GEMINI_API_BASE", Some(GEMINI_API_BASE))?,
            },
            models: ModelConfig {
                text_model: get_env(&lookup, "GEMINI_MODEL", Some(DEFAULT_MODEL))?,
            },
            relay: RelayConfig {
                protocol: parse_env(&lookup, "CHAT_STREAM_PROTOCOL", StreamProtocol::default())?,
                system_instruction: get_env(
                    &lookup,
                    "CHAT_SYSTEM_INSTRUCTION",
                    Some(DEFAULT_SYSTEM_INSTRUCTION),
                )?,
                service_name: get_env(&lookup, "CHAT_SERVICE_NAME", Some(DEFAULT_SERVICE_NAME))?,
                idle_timeout: Duration::from_secs(idle_timeout_secs),
                provider: parse_env(&lookup, "CHAT_PROVIDER", ProviderKind::Gemini)?,
            },
        })
    }
}

fn get_env<F>(lookup: &F, key: &str, default: Option<&str>) -> Result<String, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|val| !val.is_empty()) {
        Some(val) => Ok(val),
        None => match default {
            Some(def) => Ok(def.to_string()),
            None => Err(AppError::ConfigError(anyhow::anyhow!(
                "{} is required but not set",
                key
            ))),
        },
    }
}

fn parse_env<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|val| !val.is_empty()) {
        Some(val) => val.parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
        }),
        None => Ok(default),
    }
}
