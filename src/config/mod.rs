use std::env;
use thiserror::Error;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Provider settings sourced from the environment (`.env` is honored by the
/// binary before this runs).
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Upper bound on tool-dispatch rounds per query.
    pub max_tool_rounds: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {name} is required")]
    MissingVar { name: &'static str },
    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidVar { name: &'static str, value: String },
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup. The environment is
    /// process-global, so tests exercise this seam instead of mutating it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = require(&lookup, "OPENAI_API_KEY")?;
        let model = require(&lookup, "OPENAI_MODEL")?;
        let base_url = lookup("OPENAI_BASE_URL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let max_tool_rounds = match lookup("MAX_TOOL_ROUNDS") {
            None => DEFAULT_MAX_TOOL_ROUNDS,
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|rounds| *rounds > 0)
                .ok_or(ConfigError::InvalidVar {
                    name: "MAX_TOOL_ROUNDS",
                    value: raw,
                })?,
        };

        debug!(
            base_url = base_url.as_str(),
            model = model.as_str(),
            max_tool_rounds,
            "Resolved provider settings from environment"
        );

        Ok(Self {
            api_key,
            base_url,
            model,
            max_tool_rounds,
        })
    }
}

fn require<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingVar { name })
}
