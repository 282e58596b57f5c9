//! # DAX Store Adapters
//!
//! Implementations of the `DocumentStore` port shared by every readout node:
//!
//! - [`MemoryStore`] (`memory://`): in-process collections, for tests and
//!   single-process setups
//! - [`DirectoryStore`] (`file:///path`): JSON documents on a directory
//!   that every node mounts
//!
//! [`connect`] picks the adapter from the URI given on the command line.

mod directory;
mod memory;

use std::future::Future;

use dax_domain::control::{ControlDocument, DocumentId, DocumentStore, LogEntry, StatusReport, StoreError};
use serde_json::Value;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

/// Store selected at startup
#[derive(Debug, Clone)]
pub enum Store {
    Memory(MemoryStore),
    Directory(DirectoryStore),
}

/// Open the store named by `uri`
///
/// # Errors
///
/// `StoreError::UnsupportedUri` for any other scheme, `StoreError::Backend`
/// if the directory cannot be created.
pub async fn connect(uri: &str) -> Result<Store, StoreError> {
    if let Some(rest) = uri.strip_prefix("memory://") {
        if !rest.is_empty() {
            tracing::debug!(name = rest, "memory store names are ignored");
        }
        return Ok(Store::Memory(MemoryStore::new()));
    }
    if let Some(path) = uri.strip_prefix("file://") {
        if path.is_empty() {
            return Err(StoreError::UnsupportedUri(uri.to_string()));
        }
        return Ok(Store::Directory(DirectoryStore::open(path).await?));
    }
    Err(StoreError::UnsupportedUri(uri.to_string()))
}

impl DocumentStore for Store {
    fn pending_commands(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Vec<ControlDocument>, StoreError>> + Send {
        async move {
            match self {
                Self::Memory(store) => store.pending_commands(host).await,
                Self::Directory(store) => store.pending_commands(host).await,
            }
        }
    }

    fn acknowledge(
        &self,
        id: &DocumentId,
        host: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        async move {
            match self {
                Self::Memory(store) => store.acknowledge(id, host).await,
                Self::Directory(store) => store.acknowledge(id, host).await,
            }
        }
    }

    fn purge_acknowledged(&self) -> impl Future<Output = Result<usize, StoreError>> + Send {
        async move {
            match self {
                Self::Memory(store) => store.purge_acknowledged().await,
                Self::Directory(store) => store.purge_acknowledged().await,
            }
        }
    }

    fn find_options(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send {
        async move {
            match self {
                Self::Memory(store) => store.find_options(name).await,
                Self::Directory(store) => store.find_options(name).await,
            }
        }
    }

    fn insert_status(
        &self,
        report: &StatusReport,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            match self {
                Self::Memory(store) => store.insert_status(report).await,
                Self::Directory(store) => store.insert_status(report).await,
            }
        }
    }

    fn insert_log(&self, entry: &LogEntry) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            match self {
                Self::Memory(store) => store.insert_log(entry).await,
                Self::Directory(store) => store.insert_log(entry).await,
            }
        }
    }

    fn insert_command(
        &self,
        command: &ControlDocument,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            match self {
                Self::Memory(store) => store.insert_command(command).await,
                Self::Directory(store) => store.insert_command(command).await,
            }
        }
    }

    fn insert_options(&self, profile: Value) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            match self {
                Self::Memory(store) => store.insert_options(profile).await,
                Self::Directory(store) => store.insert_options(profile).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_by_scheme() {
        assert!(matches!(connect("memory://").await, Ok(Store::Memory(_))));

        let dir = TempDir::new().unwrap();
        let uri = format!("file://{}", dir.path().display());
        assert!(matches!(connect(&uri).await, Ok(Store::Directory(_))));
        assert!(dir.path().join("control").is_dir());

        assert!(matches!(
            connect("mongodb://daq:27017/daq").await,
            Err(StoreError::UnsupportedUri(_))
        ));
        assert!(matches!(
            connect("file://").await,
            Err(StoreError::UnsupportedUri(_))
        ));
    }
}
