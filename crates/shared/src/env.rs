//! Typed environment variable lookups

use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("{0} must be set")]
    Missing(String),

    #[error("{name} has an invalid value '{value}': {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

/// Read a variable, treating empty strings as unset
pub fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a variable or fall back to `default`
pub fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

/// Parse a variable, returning `default` when it is unset
pub fn env_parse<T>(name: &str, default: T) -> Result<T, EnvError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|e| EnvError::Invalid {
            name: name.to_string(),
            reason: e.to_string(),
            value,
        }),
    }
}
