//! Layered configuration for the runtime.
//!
//! Covers logging setup and the ambient request defaults, loaded from
//! files, `VOLLEY_*` environment variables and programmatic overrides.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    LogFormat, LogLevel, LogOutput, LoggingConfig, RequestDefaults, SpanEventConfig, VolleyConfig,
};
pub use validation::validate_config;
