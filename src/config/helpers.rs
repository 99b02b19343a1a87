//! Small helpers for resolving settings from the environment.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an optional environment variable, treating unset as `None`.
pub fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

/// Read a required environment variable.
pub fn require_env(key: &str, hint: &str) -> Result<String, ConfigError> {
    optional_env(key)?
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        })
}

/// Parse an optional environment variable, falling back to a default.
pub fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}

/// Parse an optional boolean environment variable.
pub fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be 'true' or 'false': {e}"),
        }),
        None => Ok(default),
    }
}

/// Split a comma-separated list, trimming blanks.
pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_csv_trims_and_drops_blanks() {
        assert_eq!(
            split_csv(" a.example , b.example ,, "),
            vec!["a.example".to_string(), "b.example".to_string()]
        );
        assert!(split_csv("").is_empty());
    }
}
