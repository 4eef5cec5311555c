//! Configuration management for Palisade
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (PALISADE_* prefix, `__` between section and key)
//! 2. palisade.local.toml (gitignored, local overrides)
//! 3. palisade.toml (git-tracked, project config)
//! 4. ~/.config/palisade/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Palisade configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PalisadeConfig {
    pub access_control: AccessControlConfig,
    pub users: UsersConfig,
}

/// Tuning for the access-control caches and revoke behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessControlConfig {
    /// Seconds a cached access context is served before it is rebuilt.
    pub context_cache_ttl_secs: u64,
    /// Maximum number of cached access contexts.
    pub context_cache_capacity: usize,
    /// Seconds a resolved role set stays cached.
    pub role_cache_ttl_secs: u64,
    /// Maximum number of cached resolved role sets.
    pub role_cache_capacity: usize,
    /// Seconds the row policies and quotas of a principal stay cached.
    pub policy_cache_ttl_secs: u64,
    /// Maximum number of principals with cached row policies or quotas.
    pub policy_cache_capacity: usize,
    /// Whether REVOKE may cut a hole in a privilege granted at a higher level.
    pub partial_revokes: bool,
    pub default_database: String,
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        Self {
            context_cache_ttl_secs: 60,
            context_cache_capacity: 1024,
            role_cache_ttl_secs: 600,
            role_cache_capacity: 1024,
            policy_cache_ttl_secs: 600,
            policy_cache_capacity: 1024,
            partial_revokes: true,
            default_database: "default".to_string(),
        }
    }
}

impl AccessControlConfig {
    pub fn context_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.context_cache_ttl_secs)
    }

    pub fn role_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.role_cache_ttl_secs)
    }

    pub fn policy_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.policy_cache_ttl_secs)
    }

    /// Checks that every cache is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = [
            ("access_control.context_cache_ttl_secs", self.context_cache_ttl_secs),
            ("access_control.role_cache_ttl_secs", self.role_cache_ttl_secs),
            ("access_control.policy_cache_ttl_secs", self.policy_cache_ttl_secs),
            ("access_control.context_cache_capacity", self.context_cache_capacity as u64),
            ("access_control.role_cache_capacity", self.role_cache_capacity as u64),
            ("access_control.policy_cache_capacity", self.policy_cache_capacity as u64),
        ];
        match settings.iter().find(|(_, value)| *value == 0) {
            Some(&(key, _)) => Err(ConfigError::ZeroCacheSetting { key }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsersConfig {
    /// User assumed when a request does not name one.
    pub default_user: String,
    /// Settings profile every session starts from. Empty for none.
    pub default_profile: String,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            default_user: "default".to_string(),
            default_profile: String::new(),
        }
    }
}

impl PalisadeConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Read a single TOML file without any layering.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.access_control.validate()?;
        if self.users.default_user.is_empty() {
            return Err(ConfigError::EmptyDefaultUser);
        }
        Ok(())
    }

    /// Short-lived caches, for tests that exercise expiry.
    pub fn testing() -> Self {
        Self {
            access_control: AccessControlConfig {
                context_cache_ttl_secs: 1,
                context_cache_capacity: 8,
                role_cache_ttl_secs: 1,
                role_cache_capacity: 8,
                policy_cache_ttl_secs: 1,
                policy_cache_capacity: 8,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = PalisadeConfig::default();
        assert_eq!(config.access_control.context_cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.access_control.role_cache_ttl(), Duration::from_secs(600));
        assert_eq!(config.access_control.policy_cache_ttl(), Duration::from_secs(600));
        assert_eq!(config.access_control.policy_cache_capacity, 1024);
        assert!(config.access_control.partial_revokes);
        assert_eq!(config.users.default_user, "default");
        assert!(config.users.default_profile.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config_is_valid() {
        let config = PalisadeConfig::testing();
        assert_eq!(config.access_control.context_cache_capacity, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let mut config = PalisadeConfig::default();
        config.access_control.context_cache_ttl_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroCacheSetting {
                key: "access_control.context_cache_ttl_secs"
            })
        ));
    }

    #[test]
    fn test_zero_policy_cache_is_rejected() {
        let mut config = PalisadeConfig::default();
        config.access_control.policy_cache_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroCacheSetting {
                key: "access_control.policy_cache_capacity"
            })
        ));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let mut config = PalisadeConfig::default();
        config.access_control.role_cache_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("palisade.toml");
        std::fs::write(
            &path,
            "[access_control]\npartial_revokes = false\ncontext_cache_capacity = 16\npolicy_cache_ttl_secs = 30\n\n[users]\ndefault_profile = \"web\"\n",
        )
        .expect("Failed to write config");

        let config = PalisadeConfig::from_toml_file(&path).expect("Failed to read config");
        assert!(!config.access_control.partial_revokes);
        assert_eq!(config.access_control.context_cache_capacity, 16);
        assert_eq!(config.access_control.role_cache_ttl_secs, 600);
        assert_eq!(config.access_control.policy_cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.users.default_profile, "web");
    }

    #[test]
    fn test_from_toml_file_reports_parse_errors() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("broken.toml");
        std::fs::write(&path, "[access_control\n").expect("Failed to write config");

        assert!(matches!(
            PalisadeConfig::from_toml_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_from_toml_file_reports_missing_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        assert!(matches!(
            PalisadeConfig::from_toml_file(temp_dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
