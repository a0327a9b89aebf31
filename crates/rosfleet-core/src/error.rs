//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid toml: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render toml: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("invalid quantity {0:?}")]
    Quantity(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
