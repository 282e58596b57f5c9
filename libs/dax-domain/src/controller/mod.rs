//! Run state machine

mod daq;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hardware::CrateError;
use crate::options::OptionsError;
use crate::strax::StraxError;

pub use daq::DaqController;

/// Run state, reported by its numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RunState {
    #[default]
    Idle,
    Arming,
    Armed,
    Running,
}

impl RunState {
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Arming => 1,
            Self::Armed => 2,
            Self::Running => 3,
        }
    }
}

impl From<RunState> for u8 {
    fn from(state: RunState) -> Self {
        state.code()
    }
}

impl TryFrom<u8> for RunState {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, String> {
        match code {
            0 => Ok(Self::Idle),
            1 => Ok(Self::Arming),
            2 => Ok(Self::Armed),
            3 => Ok(Self::Running),
            other => Err(format!("unknown run state {}", other)),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Arming => "arming",
            Self::Armed => "armed",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

/// Errors raised by run control
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The operation is not allowed in the current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: RunState,
    },

    /// Readout threads of the previous run have not finished
    #[error("{0} readout thread(s) from the previous run still running")]
    WorkersStillJoining(usize),

    /// Nothing in the options is addressed to this node
    #[error("No boards or crate controller configured for host {0}")]
    NoBoards(String),

    /// One or more boards failed to initialize
    #[error("Boards {boards:?} failed to initialize")]
    BoardInit { boards: Vec<i32> },

    /// One or more boards did not start acquiring
    #[error("Boards {boards:?} failed to start")]
    BoardStart { boards: Vec<i32> },

    #[error(transparent)]
    Crate(#[from] CrateError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Strax(#[from] StraxError),

    /// A readout thread could not be spawned
    #[error("Failed to spawn readout thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ControllerError {
    pub fn invalid_state(operation: &'static str, state: RunState) -> Self {
        Self::InvalidState { operation, state }
    }
}
