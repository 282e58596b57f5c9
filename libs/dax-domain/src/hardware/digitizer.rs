//! Digitizer driver
//!
//! One [`Digitizer`] owns one board: its link, its clock domain and a sticky
//! error flag the controller can read while a readout worker owns the board.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::models::{
    BoardModel, ACQ_SIN_START, ACQ_SOFTWARE_START, ACQ_STOP, CHANNEL_DAC_BUSY,
    STATUS_BOARD_READY, STATUS_EVENT_READY, STATUS_RUNNING,
};
use super::{poll_register, BoardLink, BusAddress, BusConnector, BusError, PollPolicy};
use crate::clock::{ClockAnomaly, ClockDomain};
use crate::logging::{Severity, SharedLog};
use crate::strax::packet::{first_header_time, DataPacket};

/// Words requested per block transfer
const BLOCK_WORDS: usize = 0x4000;

/// Errors raised by a digitizer
#[derive(Error, Debug)]
pub enum DigitizerError {
    /// Board did not answer during initialization
    #[error("Board {bid} did not respond: {source}")]
    NotResponding {
        bid: i32,
        #[source]
        source: BusError,
    },

    /// Board answered with an unexpected family code
    #[error("Board {bid} reports family {found:#04x}, expected {expected:#04x} for {model}")]
    WrongModel {
        bid: i32,
        model: &'static str,
        expected: u32,
        found: u32,
    },

    /// A bus cycle failed
    #[error("Board {bid}: {source}")]
    Bus {
        bid: i32,
        #[source]
        source: BusError,
    },

    /// A bounded poll did not see the expected state
    #[error("Board {bid} timed out waiting to become {what}")]
    PollTimeout { bid: i32, what: &'static str },

    /// A readout buffer held words but no event header
    #[error("Board {bid} returned {words} words without an event header")]
    NoEventHeader { bid: i32, words: usize },

    /// Calibration or value arrays do not cover every channel
    #[error("Board {bid}: expected {expected} channel values, got {found}")]
    ChannelCount {
        bid: i32,
        expected: usize,
        found: usize,
    },
}

/// Per-channel baseline calibration: `baseline = yint + slope * dac`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DacCalibration {
    pub slope: Vec<f64>,
    pub yint: Vec<f64>,
}

/// Driver for one digitizer board
pub struct Digitizer<L: BoardLink> {
    link: Option<L>,
    model: &'static BoardModel,
    address: BusAddress,
    bid: i32,
    clock: ClockDomain,
    error: Arc<AtomicBool>,
    max_block_reads: usize,
    log: SharedLog,
}

impl<L: BoardLink> Digitizer<L> {
    /// Open the board, reset it and check that it answers as the expected model
    pub fn init<C>(
        connector: &C,
        model: &'static BoardModel,
        address: BusAddress,
        bid: i32,
        log: SharedLog,
    ) -> Result<Self, DigitizerError>
    where
        C: BusConnector<Link = L>,
    {
        let mut link = connector
            .open_board(address)
            .map_err(|source| DigitizerError::NotResponding { bid, source })?;

        link.write_register(model.registers.reset, 0x1)
            .map_err(|source| DigitizerError::NotResponding { bid, source })?;
        let info = link
            .read_register(model.registers.board_info)
            .map_err(|source| DigitizerError::NotResponding { bid, source })?;
        let family = info & 0xFF;
        if family != model.family_code {
            return Err(DigitizerError::WrongModel {
                bid,
                model: model.name,
                expected: model.family_code,
                found: family,
            });
        }

        debug!(board = bid, model = model.name, %address, "digitizer initialized");

        Ok(Self {
            link: Some(link),
            model,
            address,
            bid,
            clock: ClockDomain::new(model.clock),
            error: Arc::new(AtomicBool::new(false)),
            max_block_reads: 64,
            log,
        })
    }

    /// Limit the number of block transfers per `read_bulk`
    pub fn with_max_block_reads(mut self, max_block_reads: usize) -> Self {
        self.max_block_reads = max_block_reads.max(1);
        self
    }

    pub fn bid(&self) -> i32 {
        self.bid
    }

    pub fn address(&self) -> BusAddress {
        self.address
    }

    pub fn model(&self) -> &'static BoardModel {
        self.model
    }

    pub fn n_channels(&self) -> u32 {
        self.model.n_channels
    }

    /// Wraparounds counted on this board's clock
    pub fn clock_counter(&self) -> u64 {
        self.clock.counter()
    }

    /// Sticky error flag, shared so it stays readable while a worker owns the board
    pub fn error_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.error)
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    fn link(&mut self) -> Result<&mut L, DigitizerError> {
        let bid = self.bid;
        self.link.as_mut().ok_or(DigitizerError::Bus {
            bid,
            source: BusError::Closed,
        })
    }

    fn flag<T>(&self, result: Result<T, DigitizerError>) -> Result<T, DigitizerError> {
        if result.is_err() {
            self.error.store(true, Ordering::Release);
        }
        result
    }

    pub fn write_register(&mut self, reg: u32, value: u32) -> Result<(), DigitizerError> {
        let bid = self.bid;
        let result = self
            .link()?
            .write_register(reg, value)
            .map_err(|source| DigitizerError::Bus { bid, source });
        self.flag(result)
    }

    pub fn read_register(&mut self, reg: u32) -> Result<u32, DigitizerError> {
        let bid = self.bid;
        let result = self
            .link()?
            .read_register(reg)
            .map_err(|source| DigitizerError::Bus { bid, source });
        self.flag(result)
    }

    /// Read whatever complete events the board holds
    ///
    /// Returns `Ok(None)` when no event is ready. The packet is stamped with
    /// the extended clock counter of its first event header.
    pub fn read_bulk(&mut self) -> Result<Option<DataPacket>, DigitizerError> {
        let status = self.read_register(self.model.registers.acq_status)?;
        if status & STATUS_EVENT_READY == 0 {
            return Ok(None);
        }

        let bid = self.bid;
        let mut words = Vec::new();
        for _ in 0..self.max_block_reads {
            let result = self
                .link()?
                .block_read(BLOCK_WORDS)
                .map_err(|source| DigitizerError::Bus { bid, source });
            let block = self.flag(result)?;
            if block.is_empty() {
                break;
            }
            words.extend_from_slice(&block);
        }
        if words.is_empty() {
            return Ok(None);
        }

        let Some(header_time) = first_header_time(&words, self.model.clock.mask()) else {
            let result = Err(DigitizerError::NoEventHeader {
                bid,
                words: words.len(),
            });
            return self.flag(result);
        };

        let reading = self.clock.extend(header_time, Instant::now());
        if let Some(anomaly) = reading.anomaly {
            self.report_clock_anomaly(anomaly);
        }

        Ok(Some(DataPacket::new(bid, words, reading.counter, header_time)))
    }

    fn report_clock_anomaly(&self, anomaly: ClockAnomaly) {
        match anomaly {
            ClockAnomaly::Jitter { raw, last } => {
                warn!(board = self.bid, raw, last, "clock went backwards without a wrap")
            }
            ClockAnomaly::Straggler { raw } => {
                warn!(board = self.bid, raw, "late read from before the last clock wrap")
            }
            ClockAnomaly::SkippedPeriod { elapsed } => self.log.entry(
                &format!(
                    "Board {} was not read for {:.1} s, clock wraps in between cannot be counted",
                    self.bid,
                    elapsed.as_secs_f64()
                ),
                Severity::Warning,
            ),
        }
    }

    /// Arm the board to start on the S-IN signal
    pub fn sin_start(&mut self) -> Result<(), DigitizerError> {
        self.write_register(self.model.registers.acq_control, ACQ_SIN_START)
    }

    pub fn software_start(&mut self) -> Result<(), DigitizerError> {
        self.write_register(self.model.registers.acq_control, ACQ_SOFTWARE_START)
    }

    pub fn acquisition_stop(&mut self) -> Result<(), DigitizerError> {
        self.write_register(self.model.registers.acq_control, ACQ_STOP)
    }

    pub fn software_trigger(&mut self) -> Result<(), DigitizerError> {
        self.write_register(self.model.registers.sw_trigger, 0x1)
    }

    pub fn acquisition_status(&mut self) -> Result<u32, DigitizerError> {
        self.read_register(self.model.registers.acq_status)
    }

    fn monitor(
        &mut self,
        reg: u32,
        mask: u32,
        expect_set: bool,
        policy: PollPolicy,
        what: &'static str,
    ) -> Result<(), DigitizerError> {
        let bid = self.bid;
        let reached = poll_register(self.link()?, reg, mask, expect_set, policy);
        if reached {
            Ok(())
        } else {
            self.flag(Err(DigitizerError::PollTimeout { bid, what }))
        }
    }

    pub fn ensure_ready(&mut self, policy: PollPolicy) -> Result<(), DigitizerError> {
        let reg = self.model.registers.acq_status;
        self.monitor(reg, STATUS_BOARD_READY, true, policy, "ready")
    }

    pub fn ensure_started(&mut self, policy: PollPolicy) -> Result<(), DigitizerError> {
        let reg = self.model.registers.acq_status;
        self.monitor(reg, STATUS_RUNNING, true, policy, "started")
    }

    pub fn ensure_stopped(&mut self, policy: PollPolicy) -> Result<(), DigitizerError> {
        let reg = self.model.registers.acq_status;
        self.monitor(reg, STATUS_RUNNING, false, policy, "stopped")
    }

    fn check_channel_count(&self, found: usize) -> Result<usize, DigitizerError> {
        let expected = self.model.n_channels as usize;
        if found < expected {
            return Err(DigitizerError::ChannelCount {
                bid: self.bid,
                expected,
                found,
            });
        }
        Ok(expected)
    }

    /// Clamp requested DAC values so the calibrated baseline stays inside the ADC range
    ///
    /// This is lossy on purpose: out-of-range requests are moved to the
    /// nearest usable value and the run goes on. Channels without
    /// calibration are left alone.
    pub fn clamp_dac_values(&self, dac_values: &mut [u16], calibration: &DacCalibration) {
        let adc_max = f64::from(self.model.adc_max);
        for (channel, value) in dac_values.iter_mut().enumerate() {
            let (Some(&slope), Some(&yint)) =
                (calibration.slope.get(channel), calibration.yint.get(channel))
            else {
                continue;
            };
            let min_dac = if yint > adc_max && slope < 0.0 {
                ((adc_max - yint) / slope).ceil().clamp(0.0, f64::from(u16::MAX)) as u16
            } else {
                0
            };
            let clamped = (*value).max(min_dac);
            if clamped != *value {
                self.log.entry(
                    &format!(
                        "Board {} channel {} DAC {:#06x} clamped to {:#06x}",
                        self.bid, channel, *value, clamped
                    ),
                    Severity::Debug,
                );
                *value = clamped;
            }
        }
    }

    /// Write the per-channel DAC offsets, waiting for each channel's DAC to be idle
    pub fn load_dac(&mut self, dac_values: &[u16], policy: PollPolicy) -> Result<(), DigitizerError> {
        let channels = self.check_channel_count(dac_values.len())?;
        let regs = self.model.registers;
        for (channel, value) in dac_values.iter().take(channels).enumerate() {
            let channel = channel as u32;
            self.monitor(
                regs.channel(regs.channel_status, channel),
                CHANNEL_DAC_BUSY,
                false,
                policy,
                "DAC idle",
            )?;
            self.write_register(regs.channel(regs.channel_dac, channel), u32::from(*value))?;
        }
        Ok(())
    }

    pub fn set_thresholds(&mut self, thresholds: &[u16]) -> Result<(), DigitizerError> {
        let channels = self.check_channel_count(thresholds.len())?;
        let regs = self.model.registers;
        for (channel, value) in thresholds.iter().take(channels).enumerate() {
            self.write_register(
                regs.channel(regs.channel_threshold, channel as u32),
                u32::from(*value),
            )?;
        }
        Ok(())
    }

    /// Release the link; later register access fails with `BusError::Closed`
    pub fn end(&mut self) {
        if self.link.take().is_some() {
            debug!(board = self.bid, "digitizer link released");
        }
    }
}
