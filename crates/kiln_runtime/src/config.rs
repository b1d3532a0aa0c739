//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What to do when a job fails for good
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnError {
    /// Keep starting jobs unaffected by the failure
    Continue,
    /// Start nothing new; let running jobs finish
    #[default]
    Quit,
    /// Cancel running jobs and stop
    Terminate,
}

impl FromStr for OnError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Self::Continue),
            "quit" => Ok(Self::Quit),
            "terminate" => Ok(Self::Terminate),
            other => Err(format!(
                "unknown on-error policy '{}' (expected continue, quit or terminate)",
                other
            )),
        }
    }
}

impl std::fmt::Display for OnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Continue => "continue",
            Self::Quit => "quit",
            Self::Terminate => "terminate",
        };
        write!(f, "{}", s)
    }
}

/// A pool was configured with no workers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{pool} must be at least 1")]
pub struct PoolSizeError {
    /// Setting name
    pub pool: &'static str,
}

/// Pool sizes and policies for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulerConfig {
    /// Concurrent track, pull and fetch jobs
    pub fetchers: usize,
    /// Concurrent build jobs
    pub builders: usize,
    /// Concurrent push jobs
    pub pushers: usize,
    /// Extra attempts for network-class jobs
    pub network_retries: u32,
    /// Failure policy
    pub on_error: OnError,
    /// Only accept strong-key cache hits
    pub strict: bool,
    /// Track unpinned sources instead of refusing to start
    pub track: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fetchers: 10,
            builders: 4,
            pushers: 4,
            network_retries: 2,
            on_error: OnError::Quit,
            strict: true,
            track: false,
        }
    }
}

impl SchedulerConfig {
    /// Check that every pool can run a job
    ///
    /// # Errors
    ///
    /// Returns the first pool sized 0
    pub fn validate(&self) -> Result<(), PoolSizeError> {
        for (pool, size) in [
            ("fetchers", self.fetchers),
            ("builders", self.builders),
            ("pushers", self.pushers),
        ] {
            if size == 0 {
                return Err(PoolSizeError { pool });
            }
        }
        Ok(())
    }

    /// Set the fetcher pool size
    #[must_use]
    pub fn with_fetchers(mut self, fetchers: usize) -> Self {
        self.fetchers = fetchers;
        self
    }

    /// Set the builder pool size
    #[must_use]
    pub fn with_builders(mut self, builders: usize) -> Self {
        self.builders = builders;
        self
    }

    /// Set the pusher pool size
    #[must_use]
    pub fn with_pushers(mut self, pushers: usize) -> Self {
        self.pushers = pushers;
        self
    }

    /// Set the network retry count
    #[must_use]
    pub fn with_network_retries(mut self, retries: u32) -> Self {
        self.network_retries = retries;
        self
    }

    /// Set the failure policy
    #[must_use]
    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// Set strictness
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Enable tracking of unpinned sources
    #[must_use]
    pub fn with_track(mut self, track: bool) -> Self {
        self.track = track;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.fetchers, 10);
        assert_eq!(config.builders, 4);
        assert_eq!(config.network_retries, 2);
        assert_eq!(config.on_error, OnError::Quit);
        assert!(config.strict);
    }

    #[test]
    fn test_zero_pool_rejected() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let err = SchedulerConfig::default().with_builders(0).validate().unwrap_err();
        assert_eq!(err.pool, "builders");
        assert_eq!(err.to_string(), "builders must be at least 1");
        assert!(SchedulerConfig::default().with_pushers(0).validate().is_err());
    }

    #[test]
    fn test_on_error_parse() {
        assert_eq!("terminate".parse::<OnError>().unwrap(), OnError::Terminate);
        assert!("abort".parse::<OnError>().is_err());
        assert_eq!(OnError::Continue.to_string(), "continue");
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"builders": 1, "on-error": "continue"}"#).unwrap();
        assert_eq!(config.builders, 1);
        assert_eq!(config.on_error, OnError::Continue);
        assert_eq!(config.pushers, 4);
    }
}
