//! # DAX Domain Layer
//!
//! This crate contains the readout core of the DAX data-acquisition node: it
//! turns digitizer buffers into time-chunked strax files and drives the run
//! state machine from commands posted to a shared document store. It follows
//! the same hexagonal layout as the rest of the workspace:
//!
//! - **Entities**: data packets, fragments, run options, control documents
//! - **Ports**: traits for external collaborators (`BusConnector`,
//!   `DocumentStore`, `LogSink`, `Compressor`)
//! - **Services**: the strax pipeline, the `DaqController` state machine and
//!   the `CommandProcessor` that applies control documents
//!
//! ## Architecture
//!
//! Hardware transport and the document-store client are expressed as traits.
//! The workspace ships a simulated VME bus (`hardware::sim`) and the
//! `dax-store` adapters; a real CAEN transport plugs in behind the same
//! `BusConnector` port.
//!
//! ## Example
//!
//! ```rust
//! use dax_domain::clock::{ClockDomain, ClockSpec};
//! use std::time::Instant;
//!
//! let mut clock = ClockDomain::new(ClockSpec::V1724);
//! let now = Instant::now();
//! clock.extend(1_600_000_000, now);
//! let after_wrap = clock.extend(100, now);
//! assert_eq!(after_wrap.counter, 1);
//! ```

pub mod clock;
pub mod control;
pub mod controller;
pub mod hardware;
pub mod logging;
pub mod options;
pub mod readout;
pub mod strax;

// Re-export commonly used types
pub use control::{CommandProcessor, DocumentStore, StoreError};
pub use controller::{DaqController, RunState};
pub use logging::{LogSink, Severity, SharedLog, TracingSink};
pub use options::RunOptions;
pub use strax::{DataPacket, StraxPipeline};
