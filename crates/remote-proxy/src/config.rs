//! Configuration for the remote proxy.

use crate::error::{ProxyError, ProxyResult};
use std::time::Duration;

/// Default deadline for single-shot commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default stall window for queued fetches.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Remote proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Name of the dispatch context, included in its log lines
    pub dispatch_name: String,

    /// Deadline applied to single-shot commands that don't pass their own
    pub command_timeout: Duration,

    /// Maximum time a queued fetch may go without progress
    pub stall_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dispatch_name: "remote-proxy".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    /// Build a config from the process environment.
    ///
    /// Reads `PROXY_DISPATCH_NAME`, `PROXY_COMMAND_TIMEOUT_MS` and
    /// `PROXY_STALL_TIMEOUT_MS`, falling back to the defaults.
    pub fn from_env() -> ProxyResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> ProxyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let dispatch_name = lookup("PROXY_DISPATCH_NAME").unwrap_or(defaults.dispatch_name);
        let command_timeout = match lookup("PROXY_COMMAND_TIMEOUT_MS") {
            Some(raw) => parse_millis("PROXY_COMMAND_TIMEOUT_MS", &raw)?,
            None => defaults.command_timeout,
        };
        let stall_timeout = match lookup("PROXY_STALL_TIMEOUT_MS") {
            Some(raw) => parse_millis("PROXY_STALL_TIMEOUT_MS", &raw)?,
            None => defaults.stall_timeout,
        };

        let config = Self {
            dispatch_name,
            command_timeout,
            stall_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make every command time out at once.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.command_timeout.is_zero() {
            return Err(ProxyError::Config("command timeout must be non-zero".into()));
        }
        if self.stall_timeout.is_zero() {
            return Err(ProxyError::Config("stall timeout must be non-zero".into()));
        }
        if self.dispatch_name.trim().is_empty() {
            return Err(ProxyError::Config("dispatch name must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_millis(key: &str, raw: &str) -> ProxyResult<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ProxyError::Config(format!("{key}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ProxyConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.stall_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_overrides() {
        let config = ProxyConfig::from_lookup(lookup_from(&[
            ("PROXY_DISPATCH_NAME", "bt"),
            ("PROXY_COMMAND_TIMEOUT_MS", "250"),
            ("PROXY_STALL_TIMEOUT_MS", " 4000 "),
        ]))
        .unwrap();

        assert_eq!(config.dispatch_name, "bt");
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.stall_timeout, Duration::from_millis(4000));
    }

    #[test]
    fn test_rejects_garbage_and_zero() {
        let err = ProxyConfig::from_lookup(lookup_from(&[("PROXY_COMMAND_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));

        let err = ProxyConfig::from_lookup(lookup_from(&[("PROXY_STALL_TIMEOUT_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }
}
