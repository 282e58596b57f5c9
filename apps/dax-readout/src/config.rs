//! Process configuration from the environment

use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Output format of the diagnostic log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Transport used to reach the boards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub poll_interval: Duration,
    pub log_format: LogFormat,
    pub bus: BusKind,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let poll_interval = match lookup("DAX_POLL_INTERVAL_MS") {
            Some(value) => {
                let ms: u64 = value
                    .trim()
                    .parse()
                    .with_context(|| format!("DAX_POLL_INTERVAL_MS='{}' is not a number", value))?;
                if ms == 0 {
                    bail!("DAX_POLL_INTERVAL_MS must be positive");
                }
                Duration::from_millis(ms)
            }
            None => Duration::from_secs(1),
        };

        let log_format = match lookup("DAX_LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("DAX_LOG_FORMAT='{}' is not 'text' or 'json'", other),
        };

        let bus = match lookup("DAX_BUS").as_deref().map(str::trim) {
            None | Some("") | Some("simulated") => BusKind::Simulated,
            Some(other) => bail!("DAX_BUS='{}' is not a bundled transport", other),
        };

        Ok(Self {
            poll_interval,
            log_format,
            bus,
        })
    }
}

/// Node identity: the hostname, with `_{index}` when several nodes share a host
pub fn node_identity(hostname: &str, node_index: Option<u32>) -> String {
    match node_index {
        Some(index) => format!("{}_{}", hostname, index),
        None => hostname.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<NodeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.bus, BusKind::Simulated);
    }

    #[test]
    fn test_overrides_and_rejections() {
        let config = config(&[("DAX_POLL_INTERVAL_MS", "250"), ("DAX_LOG_FORMAT", "json")]).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.log_format, LogFormat::Json);

        assert!(self::config(&[("DAX_POLL_INTERVAL_MS", "soon")]).is_err());
        assert!(self::config(&[("DAX_POLL_INTERVAL_MS", "0")]).is_err());
        assert!(self::config(&[("DAX_BUS", "a2818")]).is_err());
    }

    #[test]
    fn test_node_identity() {
        assert_eq!(node_identity("daq3", None), "daq3");
        assert_eq!(node_identity("daq3", Some(1)), "daq3_1");
    }
}
