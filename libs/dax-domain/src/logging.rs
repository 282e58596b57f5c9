//! Operator-facing log collaborator
//!
//! Messages an operator should see (run transitions, board failures, rejected
//! commands) go through a [`LogSink`]. Where they end up is the adapter's
//! business: the readout app persists them to the `log` collection, tests
//! record them. Diagnostic detail stays on `tracing`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Severity of a log entry, stored as its numeric priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Severity {
    /// Verbose output
    Debug = 0,
    /// Normal output
    Message = 1,
    /// Bad but minor operational impact
    Warning = 2,
    /// Major operational impact
    Error = 3,
    /// The process must not keep running after this entry
    Fatal = 4,
}

impl Severity {
    const BY_PRIORITY: [Severity; 5] = [
        Severity::Debug,
        Severity::Message,
        Severity::Warning,
        Severity::Error,
        Severity::Fatal,
    ];

    /// Numeric priority as written to the log collection
    pub fn priority(self) -> u8 {
        self as u8
    }
}

impl From<Severity> for u8 {
    fn from(severity: Severity) -> Self {
        severity.priority()
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        Self::BY_PRIORITY
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| format!("unknown log priority {}", value))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Message => "message",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Port for the logging collaborator
///
/// Implementations must be cheap and non-blocking: readout threads call
/// `entry` from the hot loop when a board misbehaves.
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    /// Record one message with the given severity
    fn entry(&self, message: &str, severity: Severity);
}

/// Shared handle used by every component that logs
pub type SharedLog = Arc<dyn LogSink>;

/// Log sink that forwards entries to `tracing`
#[derive(Debug, Clone)]
pub struct TracingSink {
    host: String,
}

impl TracingSink {
    /// Create a sink tagging every entry with this node's identity
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Convenience constructor returning the shared handle
    pub fn shared(host: impl Into<String>) -> SharedLog {
        Arc::new(Self::new(host))
    }
}

impl LogSink for TracingSink {
    fn entry(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Debug => debug!(host = %self.host, "{}", message),
            Severity::Message => info!(host = %self.host, "{}", message),
            Severity::Warning => warn!(host = %self.host, "{}", message),
            Severity::Error => error!(host = %self.host, "{}", message),
            Severity::Fatal => error!(host = %self.host, fatal = true, "{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_priorities() {
        assert_eq!(Severity::Debug.priority(), 0);
        assert_eq!(Severity::Fatal.priority(), 4);
        assert!(Severity::Warning < Severity::Error);
    }

    #[test]
    fn test_severity_roundtrip_through_priority() {
        assert_eq!(Severity::try_from(2u8), Ok(Severity::Warning));
        assert!(Severity::try_from(9u8).is_err());
    }

    #[test]
    fn test_severity_serializes_as_number() {
        let json = serde_json::to_string(&Severity::Error).unwrap();
        assert_eq!(json, "3");
    }
}
