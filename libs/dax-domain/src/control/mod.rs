//! Control plane
//!
//! Commands, status reports and log entries exchanged with the shared
//! document store, the store port itself, and the processor that turns
//! commands into run-state transitions.

mod command;
mod document;
mod ports;
mod processor;

pub use command::{run_identifier, Command, CommandError};
pub use document::{ControlDocument, DocumentId, LogEntry, StatusReport};
pub use ports::{DocumentStore, StoreError};
pub use processor::{CommandProcessor, PollSummary};
