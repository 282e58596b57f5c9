//! Run configuration
//!
//! Options are stored as named JSON profiles. At arm time the profile is
//! deep-merged with the command's override document and deserialized into a
//! typed [`RunOptions`]. Everything a node needs is filtered by its host
//! identity.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hardware::digitizer::DacCalibration;
use crate::hardware::BoardModel;

/// Errors raised while resolving run options
#[derive(Error, Debug)]
pub enum OptionsError {
    /// The command did not name an options profile
    #[error("No options mode given")]
    MissingMode,

    /// No profile with this name in the store
    #[error("Options mode '{0}' not found")]
    NotFound(String),

    /// The merged document does not deserialize
    #[error("Malformed options: {0}")]
    Parse(#[from] serde_json::Error),

    /// The options deserialize but make no sense
    #[error("Invalid options: {0}")]
    Invalid(String),
}

impl OptionsError {
    /// Create an invalid-options error with a message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Register address or value, written as a hex string (`"EF24"`, `"0x8100"`) or a number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HexRepr", into = "String")]
pub struct HexValue(pub u32);

#[derive(Deserialize)]
#[serde(untagged)]
enum HexRepr {
    Number(u32),
    Text(String),
}

impl TryFrom<HexRepr> for HexValue {
    type Error = String;

    fn try_from(repr: HexRepr) -> Result<Self, String> {
        match repr {
            HexRepr::Number(value) => Ok(Self(value)),
            HexRepr::Text(text) => {
                let digits = text
                    .trim()
                    .trim_start_matches("0x")
                    .trim_start_matches("0X");
                u32::from_str_radix(digits, 16)
                    .map(Self)
                    .map_err(|e| format!("'{}' is not a hex value: {}", text, e))
            }
        }
    }
}

impl From<HexValue> for String {
    fn from(value: HexValue) -> Self {
        format!("{:X}", value.0)
    }
}

impl fmt::Display for HexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How boards are started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RunStart {
    /// Boards wait for the crate controller's S-IN signal
    #[default]
    SIn,
    /// Each board is started by a register write
    Software,
}

impl TryFrom<u8> for RunStart {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(Self::SIn),
            1 => Ok(Self::Software),
            other => Err(format!("unknown run_start {}", other)),
        }
    }
}

impl From<RunStart> for u8 {
    fn from(start: RunStart) -> Self {
        match start {
            RunStart::SIn => 0,
            RunStart::Software => 1,
        }
    }
}

/// One digitizer entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub link: i32,
    #[serde(rename = "crate")]
    pub crate_no: i32,
    pub board: i32,
    pub vme_address: HexValue,
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
}

impl BoardConfig {
    pub fn model(&self) -> Option<&'static BoardModel> {
        BoardModel::from_type(&self.kind)
    }
}

/// One register write applied at arm time; `board = -1` targets every board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSetting {
    pub board: i32,
    pub reg: HexValue,
    pub val: HexValue,
}

fn default_true() -> bool {
    true
}

/// Crate controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrateOptions {
    pub link: i32,
    #[serde(rename = "crate")]
    pub crate_no: i32,
    /// Pulser frequency in Hz, 0 disables the pulser
    #[serde(default)]
    pub pulser_freq: f64,
    #[serde(default = "default_true")]
    pub s_in: bool,
    #[serde(default)]
    pub muon_veto: bool,
    #[serde(default)]
    pub neutron_veto: bool,
    #[serde(default)]
    pub led_trigger: bool,
    /// Node driving the controller; unset means every node with boards
    #[serde(default)]
    pub host: Option<String>,
}

impl CrateOptions {
    pub fn new(link: i32, crate_no: i32) -> Self {
        Self {
            link,
            crate_no,
            pulser_freq: 0.0,
            s_in: true,
            muon_veto: false,
            neutron_veto: false,
            led_trigger: false,
            host: None,
        }
    }
}

/// Output stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StraxOptions {
    pub output_path: PathBuf,
    /// Chunk length in ns
    pub chunk_length: u64,
    /// Chunk overlap in ns
    pub chunk_overlap: u64,
    /// Fragment payload size in bytes
    pub fragment_length: u16,
    pub chunk_name_length: usize,
    pub compressor: String,
    pub board_fail_threshold: u32,
}

impl Default for StraxOptions {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("./strax_output"),
            chunk_length: 5_000_000_000,
            chunk_overlap: 500_000_000,
            fragment_length: 220,
            chunk_name_length: 6,
            compressor: "lz4".to_string(),
            board_fail_threshold: 20,
        }
    }
}

/// Readout timing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutOptions {
    pub poll_tries: u32,
    pub poll_delay_ms: u64,
    /// Worker sleep when a pass over its boards returned nothing
    pub idle_sleep_us: u64,
    pub join_timeout_ms: u64,
    pub max_block_reads: usize,
}

impl Default for ReadoutOptions {
    fn default() -> Self {
        Self {
            poll_tries: 1000,
            poll_delay_ms: 1,
            idle_sleep_us: 100,
            join_timeout_ms: 5000,
            max_block_reads: 64,
        }
    }
}

/// Typed run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub name: String,
    #[serde(default)]
    pub run_start: RunStart,
    #[serde(default)]
    pub boards: Vec<BoardConfig>,
    #[serde(default)]
    pub registers: Vec<RegisterSetting>,
    #[serde(default)]
    pub dac: BTreeMap<i32, Vec<u16>>,
    #[serde(default)]
    pub calibration: BTreeMap<i32, DacCalibration>,
    #[serde(default)]
    pub thresholds: BTreeMap<i32, Vec<u16>>,
    /// Cable map: global channel id of every board channel
    #[serde(default)]
    pub channels: BTreeMap<i32, Vec<i16>>,
    #[serde(default, rename = "crate")]
    pub crate_options: Option<CrateOptions>,
    #[serde(default)]
    pub strax: StraxOptions,
    #[serde(default)]
    pub readout: ReadoutOptions,
}

/// Recursively merge `overlay` into `base`
///
/// Objects merge key by key; any other value in `overlay` replaces the one in
/// `base`.
pub fn merge_documents(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_documents(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

impl RunOptions {
    /// Merge an optional override into a stored profile and validate the result
    pub fn resolve(mut profile: Value, override_doc: Option<Value>) -> Result<Self, OptionsError> {
        if let Some(overlay) = override_doc {
            merge_documents(&mut profile, overlay);
        }
        if let Value::Object(map) = &mut profile {
            // Store bookkeeping, not configuration
            map.remove("_id");
        }
        let options: RunOptions = serde_json::from_value(profile)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json(json: &str) -> Result<Self, OptionsError> {
        Self::resolve(serde_json::from_str(json)?, None)
    }

    fn validate(&self) -> Result<(), OptionsError> {
        let mut seen = BTreeSet::new();
        for board in &self.boards {
            if board.model().is_none() {
                return Err(OptionsError::invalid(format!(
                    "board {} has unknown type '{}'",
                    board.board, board.kind
                )));
            }
            if !seen.insert(board.board) {
                return Err(OptionsError::invalid(format!(
                    "board {} listed twice",
                    board.board
                )));
            }
        }

        let strax = &self.strax;
        if strax.chunk_length == 0 {
            return Err(OptionsError::invalid("strax.chunk_length must be positive"));
        }
        if strax.chunk_overlap >= strax.chunk_length {
            return Err(OptionsError::invalid(
                "strax.chunk_overlap must be shorter than strax.chunk_length",
            ));
        }
        if strax.fragment_length == 0 || strax.fragment_length % 2 != 0 {
            return Err(OptionsError::invalid(
                "strax.fragment_length must be a positive even number of bytes",
            ));
        }
        if strax.chunk_name_length == 0 {
            return Err(OptionsError::invalid("strax.chunk_name_length must be positive"));
        }
        Ok(())
    }

    /// Boards addressed to `host`
    pub fn boards_for_host<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a BoardConfig> {
        self.boards.iter().filter(move |board| board.host == host)
    }

    /// Links `host` has to service
    pub fn links_for_host(&self, host: &str) -> BTreeSet<i32> {
        self.boards_for_host(host).map(|board| board.link).collect()
    }

    /// Crate controller settings if `host` drives the controller
    pub fn crate_for_host(&self, host: &str) -> Option<&CrateOptions> {
        let crate_options = self.crate_options.as_ref()?;
        let owned = match &crate_options.host {
            Some(owner) => owner == host,
            None => self.boards_for_host(host).next().is_some(),
        };
        owned.then_some(crate_options)
    }

    /// Register writes for `bid`, global settings first
    pub fn registers_for(&self, bid: i32) -> impl Iterator<Item = &RegisterSetting> {
        let global = self.registers.iter().filter(|r| r.board == -1);
        let own = self.registers.iter().filter(move |r| r.board == bid);
        global.chain(own)
    }

    pub fn dac_for(&self, bid: i32) -> Option<&[u16]> {
        self.dac.get(&bid).map(Vec::as_slice)
    }

    pub fn calibration_for(&self, bid: i32) -> Option<&DacCalibration> {
        self.calibration.get(&bid)
    }

    pub fn thresholds_for(&self, bid: i32) -> Option<&[u16]> {
        self.thresholds.get(&bid).map(Vec::as_slice)
    }

    pub fn channel_map(&self, bid: i32) -> Option<&[i16]> {
        self.channels.get(&bid).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile() -> Value {
        json!({
            "_id": "abc",
            "name": "test_mode",
            "run_start": 1,
            "boards": [
                {"link": 0, "crate": 0, "board": 100, "vme_address": "80000000", "type": "V1724", "host": "reader0"},
                {"link": 1, "crate": 0, "board": 101, "vme_address": "0x81000000", "type": "V1730", "host": "reader0"},
                {"link": 0, "crate": 0, "board": 200, "vme_address": "80000000", "type": "V1724", "host": "reader1"}
            ],
            "registers": [
                {"board": -1, "reg": "EF24", "val": "1"},
                {"board": 100, "reg": "8020", "val": "0x1F4"}
            ],
            "channels": {"100": [0, 1, 2, 3, 4, 5, 6, 7]},
            "crate": {"link": 0, "crate": 0, "pulser_freq": 0, "host": "reader0"},
            "strax": {"output_path": "/data/live", "chunk_length": 100000000}
        })
    }

    #[test]
    fn test_resolve_typed_options_with_defaults() {
        let options = RunOptions::resolve(profile(), None).unwrap();

        assert_eq!(options.name, "test_mode");
        assert_eq!(options.run_start, RunStart::Software);
        assert_eq!(options.boards[1].vme_address, HexValue(0x8100_0000));
        assert_eq!(options.strax.chunk_length, 100_000_000);
        assert_eq!(options.strax.fragment_length, 220);
        assert_eq!(options.strax.compressor, "lz4");
        assert_eq!(options.readout.poll_tries, 1000);
        assert!(options.crate_options.as_ref().unwrap().s_in);
    }

    #[test]
    fn test_override_merges_recursively() {
        let overlay = json!({
            "strax": {"compressor": "none"},
            "run_start": 0,
            "channels": {"100": [8, 9]}
        });
        let options = RunOptions::resolve(profile(), Some(overlay)).unwrap();

        assert_eq!(options.strax.compressor, "none");
        assert_eq!(options.strax.output_path, PathBuf::from("/data/live"));
        assert_eq!(options.run_start, RunStart::SIn);
        // Arrays are replaced, not merged
        assert_eq!(options.channel_map(100), Some(&[8i16, 9][..]));
    }

    #[test]
    fn test_filters_by_host() {
        let options = RunOptions::resolve(profile(), None).unwrap();

        let mine: Vec<i32> = options.boards_for_host("reader0").map(|b| b.board).collect();
        assert_eq!(mine, vec![100, 101]);
        assert_eq!(
            options.links_for_host("reader0").into_iter().collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(options.crate_for_host("reader0").is_some());
        assert!(options.crate_for_host("reader1").is_none());
        assert_eq!(options.boards_for_host("nobody").count(), 0);
    }

    #[test]
    fn test_registers_for_board_include_globals() {
        let options = RunOptions::resolve(profile(), None).unwrap();

        let regs: Vec<u32> = options.registers_for(100).map(|r| r.reg.0).collect();
        assert_eq!(regs, vec![0xEF24, 0x8020]);
        assert_eq!(options.registers_for(101).count(), 1);
    }

    #[test]
    fn test_rejects_unknown_board_type() {
        let overlay = json!({"boards": [
            {"link": 0, "crate": 0, "board": 1, "vme_address": "0", "type": "V792", "host": "h"}
        ]});
        assert!(matches!(
            RunOptions::resolve(profile(), Some(overlay)),
            Err(OptionsError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_odd_fragment_length() {
        let overlay = json!({"strax": {"fragment_length": 221}});
        assert!(matches!(
            RunOptions::resolve(profile(), Some(overlay)),
            Err(OptionsError::Invalid(_))
        ));
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        assert!(matches!(
            RunOptions::resolve(json!({"boards": "nope"}), None),
            Err(OptionsError::Parse(_))
        ));
        assert!(matches!(
            RunOptions::resolve(json!({"name": "x", "run_start": 7}), None),
            Err(OptionsError::Parse(_))
        ));
    }

    #[test]
    fn test_hex_value_accepts_numbers() {
        let value: HexValue = serde_json::from_value(json!(4096)).unwrap();
        assert_eq!(value, HexValue(4096));
        assert_eq!(serde_json::to_value(HexValue(0xEF24)).unwrap(), json!("EF24"));
    }
}
