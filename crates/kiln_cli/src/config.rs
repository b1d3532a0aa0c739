//! User configuration.
//!
//! Read from `--config`, else `$XDG_CONFIG_HOME/kiln/kiln.yaml` (or
//! `~/.config/kiln/kiln.yaml`) when present. Every field has a default.

use kiln_runtime::{PoolSizeError, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Config file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration
    #[error("invalid configuration in {}: {source}", path.display())]
    Parse {
        /// Config file
        path: PathBuf,
        /// Parser error
        #[source]
        source: serde_yaml::Error,
    },

    /// The file parses but a setting is out of range
    #[error("invalid configuration in {}: {source}", path.display())]
    Invalid {
        /// Config file
        path: PathBuf,
        /// Rejected setting
        #[source]
        source: PoolSizeError,
    },
}

/// Artifact remotes, by location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ArtifactRemotes {
    /// Queried after the local cache, in order
    pub pull: Vec<String>,
    /// Receive every built artifact
    pub push: Vec<String>,
}

/// Contents of the user configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UserConfig {
    /// Local artifact cache and build scratch space
    pub cachedir: PathBuf,
    /// Pool sizes and policies
    pub scheduler: SchedulerConfig,
    /// Artifact remotes
    pub artifacts: ArtifactRemotes,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            cachedir: default_cachedir(),
            scheduler: SchedulerConfig::default(),
            artifacts: ArtifactRemotes::default(),
        }
    }
}

impl UserConfig {
    /// Parse a configuration document
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Load `explicit`, or the default file if it exists
    ///
    /// # Errors
    ///
    /// Returns error if an explicit file is missing, or any file is malformed
    /// or sizes a pool 0
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_path() {
                Some(path) if path.is_file() => path,
                _ => return Ok(Self::default()),
            },
        };
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.scheduler.validate().map_err(|source| ConfigError::Invalid {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded user configuration");
        Ok(config)
    }
}

/// The default configuration file location
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", ".config").map(|dir| dir.join("kiln").join("kiln.yaml"))
}

fn default_cachedir() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", ".cache")
        .map(|dir| dir.join("kiln"))
        .unwrap_or_else(|| std::env::temp_dir().join("kiln"))
}

fn xdg_dir(var: &str, home_fallback: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(home_fallback)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_runtime::OnError;

    #[test]
    fn test_partial_document() {
        let config = UserConfig::from_yaml(
            "cachedir: /var/cache/kiln\nscheduler:\n  builders: 8\n  on-error: continue\nartifacts:\n  pull: [/srv/artifacts]\n",
        )
        .unwrap();
        assert_eq!(config.cachedir, PathBuf::from("/var/cache/kiln"));
        assert_eq!(config.scheduler.builders, 8);
        assert_eq!(config.scheduler.fetchers, 10);
        assert_eq!(config.scheduler.on_error, OnError::Continue);
        assert_eq!(config.artifacts.pull, vec!["/srv/artifacts".to_string()]);
        assert!(config.artifacts.push.is_empty());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(UserConfig::from_yaml("").unwrap(), UserConfig::default());
    }

    #[test]
    fn test_load_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.yaml");
        std::fs::write(&path, "scheduler:\n  network-retries: 0\n").unwrap();
        let config = UserConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.network_retries, 0);

        let missing = UserConfig::load(Some(&dir.path().join("absent.yaml")));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_zero_pool_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.yaml");
        std::fs::write(&path, "scheduler:\n  builders: 0\n").unwrap();
        let err = UserConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("builders must be at least 1"));
    }

    #[test]
    fn test_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.yaml");
        std::fs::write(&path, "scheduler: [1, 2]\n").unwrap();
        assert!(matches!(
            UserConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
