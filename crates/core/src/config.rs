//! Runtime configuration
//!
//! Every tunable comes from an environment variable and falls back to a
//! default when the variable is missing or unparseable.

use std::time::Duration;

use tracing::warn;

pub const SESSION_IDLE_TIMEOUT_VAR: &str = "HUB_SESSION_IDLE_TIMEOUT_SECS";
pub const CONNECTION_IDLE_TIMEOUT_VAR: &str = "HUB_CONNECTION_IDLE_TIMEOUT_SECS";
pub const SWEEP_INTERVAL_VAR: &str = "HUB_SWEEP_INTERVAL_SECS";
pub const CONTEXT_MAX_AGE_VAR: &str = "HUB_CONTEXT_MAX_AGE_SECS";
pub const KEEPALIVE_INTERVAL_VAR: &str = "HUB_KEEPALIVE_INTERVAL_SECS";
pub const CONNECTION_DRAIN_TIMEOUT_VAR: &str = "HUB_CONNECTION_DRAIN_TIMEOUT_SECS";
pub const EVENT_BUFFER_VAR: &str = "HUB_EVENT_BUFFER";

/// Tunables of the orchestration core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Sessions idle for longer than this are deleted
    pub session_idle_timeout: Duration,
    /// Pooled tool-server connections idle for longer than this are closed
    pub connection_idle_timeout: Duration,
    /// How often the background sweeps run
    pub sweep_interval: Duration,
    /// Execution contexts older than this are dropped as leaked
    pub context_max_age: Duration,
    /// Quiet period after which a run emits a keepalive event
    pub keepalive_interval: Duration,
    /// How long a retired connection may wait for in-flight calls before closing
    pub connection_drain_timeout: Duration,
    /// Capacity of the per-run event channel
    pub event_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_secs(30 * 60),
            connection_idle_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
            context_max_age: Duration::from_secs(60 * 60),
            keepalive_interval: Duration::from_secs(15),
            connection_drain_timeout: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

impl HubConfig {
    /// Load from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            parse_var(&lookup, name, default.as_secs()).map_or(default, Duration::from_secs)
        };

        Self {
            session_idle_timeout: secs(SESSION_IDLE_TIMEOUT_VAR, defaults.session_idle_timeout),
            connection_idle_timeout: secs(
                CONNECTION_IDLE_TIMEOUT_VAR,
                defaults.connection_idle_timeout,
            ),
            sweep_interval: secs(SWEEP_INTERVAL_VAR, defaults.sweep_interval),
            context_max_age: secs(CONTEXT_MAX_AGE_VAR, defaults.context_max_age),
            keepalive_interval: secs(KEEPALIVE_INTERVAL_VAR, defaults.keepalive_interval),
            connection_drain_timeout: secs(
                CONNECTION_DRAIN_TIMEOUT_VAR,
                defaults.connection_drain_timeout,
            ),
            event_buffer: parse_var(&lookup, EVENT_BUFFER_VAR, defaults.event_buffer as u64)
                .map_or(defaults.event_buffer, |v| v as usize),
        }
    }
}

/// Positive integer value of `name`, or `None` to use the default
fn parse_var<F>(lookup: &F, name: &str, default: u64) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!("Ignoring invalid {}={:?}, using {}", name, raw, default);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HubConfig::from_lookup(|_| None);
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.session_idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_overrides() {
        let config = HubConfig::from_lookup(lookup_from(&[
            (SESSION_IDLE_TIMEOUT_VAR, "120"),
            (SWEEP_INTERVAL_VAR, " 5 "),
            (EVENT_BUFFER_VAR, "16"),
        ]));
        assert_eq!(config.session_idle_timeout, Duration::from_secs(120));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.event_buffer, 16);
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let config = HubConfig::from_lookup(lookup_from(&[
            (CONNECTION_IDLE_TIMEOUT_VAR, "ten minutes"),
            (KEEPALIVE_INTERVAL_VAR, "0"),
        ]));
        assert_eq!(config.connection_idle_timeout, Duration::from_secs(600));
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
    }
}
