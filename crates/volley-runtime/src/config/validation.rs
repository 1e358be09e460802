//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogLevel, LoggingConfig, LogOutput, RequestDefaults, VolleyConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &VolleyConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_request_defaults(&config.defaults)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    for (module, level) in &logging.filters {
        if module.trim().is_empty() {
            return Err(ConfigError::validation("Log filter module cannot be empty"));
        }
        level.parse::<LogLevel>().map_err(|_| {
            ConfigError::validation(format!(
                "Invalid log level for '{module}': {level}. Valid values are: {:?}",
                LogLevel::ALL.map(LogLevel::as_str)
            ))
        })?;
    }

    if logging.output == LogOutput::File && logging.max_files == 0 {
        return Err(ConfigError::validation(
            "max_files must be greater than 0 for file output",
        ));
    }

    Ok(())
}

/// Validates the cache and retry windows.
fn validate_request_defaults(defaults: &RequestDefaults) -> ConfigResult<()> {
    let at_least_forever = |name: &str, value: Option<i64>| match value {
        Some(v) if v < -1 => Err(ConfigError::validation(format!(
            "{name} must be -1 (forever) or non-negative, got {v}"
        ))),
        _ => Ok(()),
    };
    at_least_forever("cache_time_ms", defaults.cache_time_ms)?;
    at_least_forever("stale_time_ms", defaults.stale_time_ms)?;
    at_least_forever("retry_count", defaults.retry_count)?;

    if let (Some(stale), Some(cache)) = (defaults.stale_time_ms, defaults.cache_time_ms) {
        if stale >= 0 && cache >= 0 && stale > cache {
            return Err(ConfigError::validation(format!(
                "stale_time_ms ({stale}) cannot exceed cache_time_ms ({cache})"
            )));
        }
    }

    Ok(())
}
