//! Documents exchanged through the shared store

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::controller::RunState;
use crate::logging::Severity;

/// Identifier of a control document
///
/// Wraps a UUID v7 so documents sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DocumentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Command posted to the `control` collection
///
/// Only the barrier fields are typed. Everything else (`command`, `user`,
/// `run_identifier`, `mode`, `options_override`) stays in `body` so a
/// malformed command still loads and can be acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlDocument {
    #[serde(rename = "_id", default)]
    pub id: DocumentId,
    /// Nodes the command is addressed to
    #[serde(default)]
    pub host: Vec<String>,
    /// Nodes that have seen the command
    #[serde(default)]
    pub acknowledged: Vec<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ControlDocument {
    pub fn new<I, S>(command: &str, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut body = Map::new();
        body.insert("command".to_string(), Value::from(command));
        Self {
            id: DocumentId::new(),
            host: hosts.into_iter().map(Into::into).collect(),
            acknowledged: Vec::new(),
            body,
        }
    }

    /// Set any body field
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    pub fn with_mode(self, mode: &str) -> Self {
        self.with("mode", mode)
    }

    pub fn with_run_identifier(self, run: impl Into<Value>) -> Self {
        self.with("run_identifier", run)
    }

    pub fn with_override(self, options_override: Value) -> Self {
        self.with("options_override", options_override)
    }

    pub fn with_user(self, user: &str) -> Self {
        self.with("user", user)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn is_addressed_to(&self, host: &str) -> bool {
        self.host.iter().any(|h| h == host)
    }

    pub fn is_acknowledged_by(&self, host: &str) -> bool {
        self.acknowledged.iter().any(|h| h == host)
    }

    /// Add `host` to the acknowledgment set; false if it was already there
    pub fn acknowledge(&mut self, host: &str) -> bool {
        if self.is_acknowledged_by(host) {
            return false;
        }
        self.acknowledged.push(host.to_string());
        true
    }

    /// Every addressed node has acknowledged
    pub fn is_complete(&self) -> bool {
        self.acknowledged.len() == self.host.len()
    }
}

/// Snapshot written to the `status` collection once per control tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub host: String,
    /// Readout rate in MB/s since the previous report
    pub rate: f64,
    pub status: RunState,
    /// Data waiting in the pipeline, in MB
    pub buffer_length: f64,
    pub run_mode: String,
    pub current_run_id: String,
    pub time: DateTime<Utc>,
    /// Health flag: a board, the pipeline or a readout thread is in trouble
    pub error: bool,
}

/// Entry in the `log` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub host: String,
    pub message: String,
    pub priority: Severity,
    pub time: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(host: impl Into<String>, message: impl Into<String>, priority: Severity) -> Self {
        Self {
            host: host.into(),
            message: message.into(),
            priority,
            time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_document_keeps_free_fields() {
        let doc = ControlDocument::new("arm", ["reader0", "reader1"])
            .with_mode("background")
            .with_user("shifter")
            .with_run_identifier(1042);

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["command"], json!("arm"));
        assert_eq!(value["mode"], json!("background"));
        assert_eq!(value["host"], json!(["reader0", "reader1"]));

        let back: ControlDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_malformed_body_still_loads() {
        let doc: ControlDocument = serde_json::from_value(json!({
            "host": ["reader0"],
            "command": 17,
            "run_identifier": {"nested": true}
        }))
        .unwrap();

        assert!(doc.is_addressed_to("reader0"));
        assert_eq!(doc.field("command"), Some(&json!(17)));
    }

    #[test]
    fn test_barrier_completes_when_all_acknowledged() {
        let mut doc = ControlDocument::new("stop", ["a", "b"]);

        assert!(doc.acknowledge("b"));
        assert!(!doc.acknowledge("b"));
        assert!(!doc.is_complete());
        assert!(doc.acknowledge("a"));
        assert!(doc.is_complete());
    }

    #[test]
    fn test_status_report_encodes_state_as_number() {
        let report = StatusReport {
            host: "reader0".to_string(),
            rate: 1.5,
            status: RunState::Running,
            buffer_length: 0.0,
            run_mode: "none".to_string(),
            current_run_id: "none".to_string(),
            time: Utc::now(),
            error: false,
        };
        assert_eq!(serde_json::to_value(&report).unwrap()["status"], json!(3));
    }
}
