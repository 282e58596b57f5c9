//! In-process document store
//!
//! Every clone shares the same collections, so several readout nodes in one
//! process (tests, a single-host setup) see one store.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dax_domain::control::{ControlDocument, DocumentId, DocumentStore, LogEntry, StatusReport, StoreError};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Default)]
struct Collections {
    control: Vec<ControlDocument>,
    options: BTreeMap<String, Value>,
    status: Vec<StatusReport>,
    log: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commands still in the control collection
    pub fn commands(&self) -> Vec<ControlDocument> {
        self.lock().control.clone()
    }

    pub fn status_reports(&self) -> Vec<StatusReport> {
        self.lock().status.clone()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.lock().log.clone()
    }
}

impl DocumentStore for MemoryStore {
    fn pending_commands(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Vec<ControlDocument>, StoreError>> + Send {
        let mut pending: Vec<ControlDocument> = self
            .lock()
            .control
            .iter()
            .filter(|doc| doc.is_addressed_to(host) && !doc.is_acknowledged_by(host))
            .cloned()
            .collect();
        pending.sort_by_key(|doc| doc.id);
        async move { Ok(pending) }
    }

    fn acknowledge(
        &self,
        id: &DocumentId,
        host: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let found = match self.lock().control.iter_mut().find(|doc| doc.id == *id) {
            Some(doc) => {
                doc.acknowledge(host);
                true
            }
            None => false,
        };
        async move { Ok(found) }
    }

    fn purge_acknowledged(&self) -> impl Future<Output = Result<usize, StoreError>> + Send {
        let purged = {
            let mut collections = self.lock();
            let before = collections.control.len();
            collections.control.retain(|doc| !doc.is_complete());
            before - collections.control.len()
        };
        if purged > 0 {
            debug!(purged, "purged acknowledged commands");
        }
        async move { Ok(purged) }
    }

    fn find_options(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send {
        let profile = self.lock().options.get(name).cloned();
        async move { Ok(profile) }
    }

    fn insert_status(
        &self,
        report: &StatusReport,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.lock().status.push(report.clone());
        async move { Ok(()) }
    }

    fn insert_log(&self, entry: &LogEntry) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.lock().log.push(entry.clone());
        async move { Ok(()) }
    }

    fn insert_command(
        &self,
        command: &ControlDocument,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.lock().control.push(command.clone());
        async move { Ok(()) }
    }

    fn insert_options(&self, profile: Value) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = match profile.get("name").and_then(Value::as_str) {
            Some(name) => {
                let name = name.to_string();
                self.lock().options.insert(name, profile);
                Ok(())
            }
            None => Err(StoreError::backend("options profile has no name")),
        };
        async move { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pending_excludes_acknowledged_and_foreign() {
        let store = MemoryStore::new();
        let mine = ControlDocument::new("arm", ["reader0"]);
        let other = ControlDocument::new("arm", ["reader1"]);
        store.insert_command(&mine).await.unwrap();
        store.insert_command(&other).await.unwrap();

        let pending = store.pending_commands("reader0").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, mine.id);

        assert!(store.acknowledge(&mine.id, "reader0").await.unwrap());
        assert!(store.pending_commands("reader0").await.unwrap().is_empty());
        assert!(!store.acknowledge(&DocumentId::new(), "reader0").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_only_removes_complete_commands() {
        let store = MemoryStore::new();
        let doc = ControlDocument::new("stop", ["a", "b"]);
        store.insert_command(&doc).await.unwrap();

        store.acknowledge(&doc.id, "a").await.unwrap();
        assert_eq!(store.purge_acknowledged().await.unwrap(), 0);
        store.acknowledge(&doc.id, "b").await.unwrap();
        assert_eq!(store.purge_acknowledged().await.unwrap(), 1);
        assert!(store.commands().is_empty());
    }

    #[tokio::test]
    async fn test_options_by_name() {
        let store = MemoryStore::new();
        store
            .insert_options(json!({"name": "led", "run_start": 1}))
            .await
            .unwrap();

        assert_eq!(
            store.find_options("led").await.unwrap(),
            Some(json!({"name": "led", "run_start": 1}))
        );
        assert_eq!(store.find_options("missing").await.unwrap(), None);
        assert!(store.insert_options(json!({"run_start": 1})).await.is_err());
    }
}
