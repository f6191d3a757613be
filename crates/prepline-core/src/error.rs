//! Configuration and vocabulary errors.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration or parsing vocabulary values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration: {0}")]
    Duration(String),

    #[error("unknown pool type: {0}")]
    UnknownPool(String),

    #[error("unknown priority: {0}")]
    UnknownPriority(String),

    #[error("invalid config value: {0}")]
    Invalid(String),
}
