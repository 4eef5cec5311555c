//! Errors raised while reading or checking Palisade configuration.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A cache TTL or capacity of zero would disable caching entirely.
    #[error("{key} must be greater than zero")]
    ZeroCacheSetting { key: &'static str },

    #[error("users.default_user must name a user")]
    EmptyDefaultUser,

    #[error("no home directory to place user configuration in")]
    NoUserConfigDir,
}
