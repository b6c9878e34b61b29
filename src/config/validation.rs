//! Configuration errors and value helpers.

use std::time::Duration;

use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Parse duration string using humantime.
///
/// Supports `30s`, `1m`, `5m30s`, `1h`, `1d`, `100ms` and similar.
///
/// # Examples
///
/// ```
/// use hostwatch::config::parse_duration;
///
/// assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
/// assert_eq!(parse_duration("5m").unwrap().as_secs(), 300);
/// assert_eq!(parse_duration("1h30m").unwrap().as_secs(), 5400);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `${VAR:-default}`; unset variables without a
/// default expand to an empty string.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let default_value = caps.get(2).map_or("", |m| m.as_str());
            std::env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

/// Treat blank strings as absent.
pub(crate) fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_expand_env_vars_default_and_missing() {
        assert_eq!(expand_env_vars("plain"), "plain");
        assert_eq!(
            expand_env_vars("secret: ${HOSTWATCH_TEST_UNSET_9431:-fallback}"),
            "secret: fallback"
        );
        assert_eq!(expand_env_vars("secret: ${HOSTWATCH_TEST_UNSET_9431}"), "secret: ");
    }

    #[test]
    fn test_expand_env_vars_from_env() {
        // SAFETY: test-specific variable, not read elsewhere.
        unsafe {
            std::env::set_var("HOSTWATCH_TEST_SECRET_EXPAND", "s3cret");
        }
        assert_eq!(
            expand_env_vars("trigger_secret: ${HOSTWATCH_TEST_SECRET_EXPAND:-x}"),
            "trigger_secret: s3cret"
        );
        // SAFETY: cleanup of the variable set above.
        unsafe {
            std::env::remove_var("HOSTWATCH_TEST_SECRET_EXPAND");
        }
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank(&Some(" x ".to_string())), Some("x"));
        assert_eq!(non_blank(&Some("  ".to_string())), None);
        assert_eq!(non_blank(&None), None);
    }
}
