//! Board drivers and the bus port they run on
//!
//! The low-level VME transport is an external collaborator. The domain only
//! needs three primitives per board (register read, register write, block
//! transfer), expressed by [`BoardLink`], and a way to open links, expressed
//! by [`BusConnector`]. Board models differ in data only: register offsets,
//! channel count, clock and data format live in [`models`].

pub mod crate_controller;
pub mod digitizer;
pub mod models;
pub mod sim;

use std::fmt;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

pub use crate_controller::{CrateController, CrateError};
pub use digitizer::{Digitizer, DigitizerError};
pub use models::{BoardModel, CrateModel, DataFormat, RegisterMap};

/// Where a board sits on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusAddress {
    /// Optical link number
    pub link: i32,
    /// Crate number on that link
    pub crate_no: i32,
    /// VME base address of the board
    pub base: u32,
}

impl BusAddress {
    pub fn new(link: i32, crate_no: i32, base: u32) -> Self {
        Self {
            link,
            crate_no,
            base,
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "link {} crate {} base {:#x}",
            self.link, self.crate_no, self.base
        )
    }
}

/// Errors raised by the bus transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Nothing answered at the address
    #[error("No response from {0}")]
    NoResponse(BusAddress),

    /// A register cycle timed out
    #[error("Bus timeout accessing register {reg:#06x}")]
    Timeout { reg: u32 },

    /// A block transfer failed
    #[error("Block transfer failed: {0}")]
    Transfer(String),

    /// The link was already released
    #[error("Link closed")]
    Closed,
}

impl BusError {
    /// Create a transfer error with a message
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }
}

/// One open handle to a board (or to the crate controller itself)
pub trait BoardLink: Send {
    /// Write a 32-bit register
    fn write_register(&mut self, reg: u32, value: u32) -> Result<(), BusError>;

    /// Read a 32-bit register
    fn read_register(&mut self, reg: u32) -> Result<u32, BusError>;

    /// Block transfer of at most `max_words` words from the readout buffer
    ///
    /// An empty vector means the board has nothing more to give.
    fn block_read(&mut self, max_words: usize) -> Result<Vec<u32>, BusError>;
}

/// Port for opening links on the bus
///
/// This trait abstracts the VME transport (optical link bridge, simulated
/// bus, ...). Implementations must handle:
/// - Resolving an address to a board that answers
/// - Handing out one independent link per board so each readout thread
///   owns its boards
/// - Converting transport errors to `BusError`
///
/// ## Static Dispatch
///
/// The link type is an associated type, so digitizers and readout threads
/// are monomorphized over the transport.
pub trait BusConnector: Send + Sync + 'static {
    /// Handle type produced for each board
    type Link: BoardLink + 'static;

    /// Open a link to a digitizer
    ///
    /// # Arguments
    ///
    /// * `address` - Optical link, crate number and VME base address
    ///
    /// # Returns
    ///
    /// A link owning the board until it is dropped
    ///
    /// # Errors
    ///
    /// Returns `BusError::NoResponse` if nothing answers at `address`
    fn open_board(&self, address: BusAddress) -> Result<Self::Link, BusError>;

    /// Open a link to the crate controller on `link`/`crate_no`
    ///
    /// # Arguments
    ///
    /// * `link` - Optical link the controller sits on
    /// * `crate_no` - Crate number on that link
    ///
    /// # Errors
    ///
    /// Returns a `BusError` if the controller cannot be opened
    fn open_controller(&self, link: i32, crate_no: i32) -> Result<Self::Link, BusError>;
}

/// Bounded retry policy for "wait for hardware state" operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum number of register reads
    pub tries: u32,
    /// Delay between two reads
    pub delay: Duration,
}

impl PollPolicy {
    pub fn new(tries: u32, delay: Duration) -> Self {
        Self { tries, delay }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            tries: 1000,
            delay: Duration::from_millis(1),
        }
    }
}

/// Poll `reg` until `(value & mask != 0) == expect_set`, at most `policy.tries` times
///
/// Bus errors count as a failed try. Returns whether the state was reached.
pub fn poll_register<L>(
    link: &mut L,
    reg: u32,
    mask: u32,
    expect_set: bool,
    policy: PollPolicy,
) -> bool
where
    L: BoardLink + ?Sized,
{
    for attempt in 0..policy.tries {
        match link.read_register(reg) {
            Ok(value) if ((value & mask) != 0) == expect_set => return true,
            Ok(value) => {
                trace!(reg, value, mask, attempt, "register not in expected state yet")
            }
            Err(err) => trace!(reg, attempt, error = %err, "register poll read failed"),
        }
        if attempt + 1 < policy.tries {
            thread::sleep(policy.delay);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingLink {
        reads: u32,
        set_after: u32,
    }

    impl BoardLink for CountingLink {
        fn write_register(&mut self, _reg: u32, _value: u32) -> Result<(), BusError> {
            Ok(())
        }

        fn read_register(&mut self, reg: u32) -> Result<u32, BusError> {
            self.reads += 1;
            if self.reads == 1 {
                return Err(BusError::Timeout { reg });
            }
            Ok(if self.reads > self.set_after { 0x4 } else { 0 })
        }

        fn block_read(&mut self, _max_words: usize) -> Result<Vec<u32>, BusError> {
            Ok(Vec::new())
        }
    }

    fn quick(tries: u32) -> PollPolicy {
        PollPolicy::new(tries, Duration::from_micros(10))
    }

    #[test]
    fn test_poll_succeeds_once_bit_is_set() {
        let mut link = CountingLink {
            reads: 0,
            set_after: 3,
        };
        assert!(poll_register(&mut link, 0x8104, 0x4, true, quick(10)));
        assert_eq!(link.reads, 4);
    }

    #[test]
    fn test_poll_gives_up_after_bounded_tries() {
        let mut link = CountingLink {
            reads: 0,
            set_after: 100,
        };
        assert!(!poll_register(&mut link, 0x8104, 0x4, true, quick(5)));
        assert_eq!(link.reads, 5);
    }

    #[test]
    fn test_poll_for_cleared_bit() {
        let mut link = CountingLink {
            reads: 0,
            set_after: 100,
        };
        // First read errors, second reads 0
        assert!(poll_register(&mut link, 0x8104, 0x4, false, quick(5)));
        assert_eq!(link.reads, 2);
    }

    #[test]
    fn test_bus_address_display() {
        let addr = BusAddress::new(1, 0, 0x8000_0000);
        assert_eq!(addr.to_string(), "link 1 crate 0 base 0x80000000");
    }
}
