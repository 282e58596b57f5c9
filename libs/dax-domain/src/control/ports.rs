//! Port trait for the shared document store
//!
//! Every readout node talks to the same store. Adapters live in the
//! `dax-store` crate; the domain only depends on this contract.

use std::future::Future;

use serde_json::Value;
use thiserror::Error;

use super::document::{ControlDocument, DocumentId, LogEntry, StatusReport};

/// Errors raised by a store adapter
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend failed (connection, I/O, lock)
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A stored document does not decode
    #[error("Corrupt document {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The store URI is not understood
    #[error("Unsupported store URI: {0}")]
    UnsupportedUri(String),
}

impl StoreError {
    /// Create a backend error with a message
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Port trait for the shared document store
///
/// This trait abstracts the store every readout node polls for commands and
/// writes its status and log documents to (in-memory, shared directory, ...).
/// Implementations must handle:
/// - Filtering commands by addressed host and acknowledgment
/// - Atomic acknowledgment and barrier purge across all nodes
/// - Converting backend errors to `StoreError`
///
/// ## Barrier
///
/// `acknowledge` and `purge_acknowledged` must each be atomic with respect
/// to every other node using the same store: a purge removes a command only
/// if it is complete at the moment of removal, never based on an earlier
/// read.
///
/// ## Implementation Note
///
/// Methods return `impl Future` so the command processor is monomorphized
/// over the adapter, without trait objects.
pub trait DocumentStore: Send + Sync {
    /// Commands addressed to `host` that `host` has not acknowledged, oldest first
    ///
    /// # Arguments
    ///
    /// * `host` - Node identity as it appears in a command's `host` list
    ///
    /// # Returns
    ///
    /// The pending commands; an empty list when there is nothing to do
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the store cannot be read. Documents
    /// that do not decode are skipped, not reported.
    fn pending_commands(
        &self,
        host: &str,
    ) -> impl Future<Output = Result<Vec<ControlDocument>, StoreError>> + Send;

    /// Add `host` to a command's acknowledgment set
    ///
    /// Acknowledging twice leaves a single entry.
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier of the command
    /// * `host` - Node identity to record
    ///
    /// # Returns
    ///
    /// `false` if the command no longer exists
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the update cannot be made atomically
    fn acknowledge(
        &self,
        id: &DocumentId,
        host: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Delete every command whose acknowledgment set is complete
    ///
    /// # Returns
    ///
    /// The number of deleted commands
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the store cannot be locked or written
    fn purge_acknowledged(&self) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Options profile stored under `name`
    ///
    /// # Arguments
    ///
    /// * `name` - Profile name, the `mode` of an arm command
    ///
    /// # Returns
    ///
    /// The raw profile document, or `None` if no profile has this name
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` for an unreadable store or an invalid
    /// name, `StoreError::Corrupt` if the profile does not decode
    fn find_options(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Append one status report
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the report cannot be written
    fn insert_status(
        &self,
        report: &StatusReport,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn insert_log(&self, entry: &LogEntry) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Post a command (used by run-control tools and tests)
    fn insert_command(
        &self,
        command: &ControlDocument,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Store or replace an options profile
    ///
    /// # Arguments
    ///
    /// * `profile` - Options document; its name is taken from the `name` field
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the profile has no usable name or
    /// cannot be written
    fn insert_options(&self, profile: Value) -> impl Future<Output = Result<(), StoreError>> + Send;
}
