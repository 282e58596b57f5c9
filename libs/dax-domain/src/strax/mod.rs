//! Raw board buffers to chunked strax files
//!
//! A [`DataPacket`] is what one bulk read returned. The [`StraxPipeline`]
//! decodes its events, cuts every channel pulse into fixed-size fragments,
//! routes each fragment to a time chunk and flushes chunks to disk once no
//! source can still deliver data for them.

pub mod compress;
pub mod fragment;
pub mod packet;
pub mod pipeline;

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::hardware::BoardModel;
use crate::options::RunOptions;

pub use compress::{compressor_for, Compressor, Lz4Compressor, Passthrough};
pub use fragment::{FragmentHeader, FRAGMENT_HEADER_SIZE};
pub use packet::DataPacket;
pub use pipeline::{PipelineStats, StraxPipeline};

/// Errors raised by the strax pipeline
#[derive(Error, Debug)]
pub enum StraxError {
    /// Board data could not be decoded
    #[error("Malformed data from board {board}: {reason}")]
    Malformed { board: i32, reason: String },

    /// The board flagged an internal failure in an event header
    #[error("Board {0} reported a failure in its event header")]
    BoardFail(i32),

    /// The board was disabled after too many failures
    #[error("Board {0} is disabled for this run")]
    BoardDisabled(i32),

    /// The pipeline was already closed
    #[error("Pipeline closed")]
    Closed,

    /// Writing chunk output failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No compressor registered under this name
    #[error("Unknown compressor '{0}'")]
    UnknownCompressor(String),

    /// A compressed file could not be read back
    #[error("Decompression failed: {0}")]
    Decompress(String),
}

impl StraxError {
    /// Create a malformed-data error for a board
    pub fn malformed(board: i32, reason: impl Into<String>) -> Self {
        Self::Malformed {
            board,
            reason: reason.into(),
        }
    }

    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StraxError>;

/// Everything the pipeline needs to know about a run
#[derive(Debug, Clone)]
pub struct StraxConfig {
    pub host: String,
    pub output_path: PathBuf,
    pub chunk_length: u64,
    pub chunk_overlap: u64,
    pub fragment_length: usize,
    pub chunk_name_length: usize,
    pub board_fail_threshold: u32,
    /// Model of every board that may deliver packets
    pub boards: BTreeMap<i32, &'static BoardModel>,
    /// Cable map per board
    pub channels: BTreeMap<i32, Vec<i16>>,
}

impl StraxConfig {
    /// Pipeline settings for the boards `host` reads out
    pub fn from_options(options: &RunOptions, host: &str) -> Self {
        let boards: BTreeMap<i32, &'static BoardModel> = options
            .boards_for_host(host)
            .filter_map(|board| board.model().map(|model| (board.board, model)))
            .collect();
        let channels = boards
            .keys()
            .filter_map(|bid| options.channel_map(*bid).map(|map| (*bid, map.to_vec())))
            .collect();
        let strax = &options.strax;
        Self {
            host: host.to_string(),
            output_path: strax.output_path.clone(),
            chunk_length: strax.chunk_length,
            chunk_overlap: strax.chunk_overlap,
            fragment_length: usize::from(strax.fragment_length),
            chunk_name_length: strax.chunk_name_length,
            board_fail_threshold: strax.board_fail_threshold,
            boards,
            channels,
        }
    }

    /// Global channel id of a board channel: cable map, else `board * n_channels + channel`
    pub fn global_channel(&self, bid: i32, channel: u32) -> Option<i16> {
        if let Some(id) = self
            .channels
            .get(&bid)
            .and_then(|map| map.get(channel as usize))
        {
            return Some(*id);
        }
        let n_channels = self.boards.get(&bid)?.n_channels as i64;
        i16::try_from(i64::from(bid) * n_channels + i64::from(channel)).ok()
    }
}
