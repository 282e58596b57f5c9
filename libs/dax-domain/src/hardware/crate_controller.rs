//! Crate trigger controller
//!
//! Drives the backplane outputs shared by every board in a crate: S-IN to
//! start boards armed for hardware start, the veto and LED outputs and the
//! optional pulser.

use thiserror::Error;
use tracing::{debug, info};

use super::models::CrateModel;
use super::{BoardLink, BusConnector, BusError};
use crate::logging::{Severity, SharedLog};
use crate::options::CrateOptions;

/// Errors raised by the crate controller
#[derive(Error, Debug)]
pub enum CrateError {
    /// The controller could not be opened
    #[error("Crate controller on link {link} crate {crate_no} did not respond: {source}")]
    NotResponding {
        link: i32,
        crate_no: i32,
        #[source]
        source: BusError,
    },

    /// A register write failed
    #[error("Crate controller write failed: {0}")]
    Bus(#[from] BusError),

    /// The pulser frequency cannot be expressed with the available units
    #[error("Pulser frequency {0} Hz out of range")]
    PulserRange(f64),
}

/// Pulser A timing in one of the controller's time units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulserTiming {
    /// Index of the time unit, written to the range register
    pub range: u32,
    pub period: u32,
    pub width: u32,
}

impl PulserTiming {
    /// Pick the finest unit in which the period fits eight bits
    pub fn for_frequency(model: &CrateModel, frequency: f64) -> Result<Self, CrateError> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(CrateError::PulserRange(frequency));
        }
        let period_ns = 1e9 / frequency;
        model
            .pulser_units_ns
            .iter()
            .enumerate()
            .find_map(|(range, unit)| {
                let period = (period_ns / *unit as f64).round();
                (1.0..=255.0).contains(&period).then(|| {
                    let period = period as u32;
                    Self {
                        range: range as u32,
                        period,
                        width: (period / 2).max(1),
                    }
                })
            })
            .ok_or(CrateError::PulserRange(frequency))
    }

    /// Value of the timing register: width in the high byte, period in the low byte
    pub fn register_value(&self) -> u32 {
        (self.width << 8) | self.period
    }
}

/// Handle on one crate controller
pub struct CrateController<L: BoardLink> {
    link: Option<L>,
    model: CrateModel,
    options: CrateOptions,
    log: SharedLog,
}

impl<L: BoardLink> CrateController<L> {
    /// Open the controller, clear every output and program the pulser
    pub fn init<C>(connector: &C, options: &CrateOptions, log: SharedLog) -> Result<Self, CrateError>
    where
        C: BusConnector<Link = L>,
    {
        let model = CrateModel::V2718;
        let mut link = connector
            .open_controller(options.link, options.crate_no)
            .map_err(|source| CrateError::NotResponding {
                link: options.link,
                crate_no: options.crate_no,
                source,
            })?;

        link.write_register(model.output_clear, 0x7FF)?;

        if options.pulser_freq > 0.0 {
            let timing = PulserTiming::for_frequency(&model, options.pulser_freq)?;
            link.write_register(model.pulser_a_timing, timing.register_value())?;
            link.write_register(model.pulser_a_range, timing.range)?;
            // Route pulser A to its front panel output
            link.write_register(model.output_mux_set, model.outputs.pulser)?;
            debug!(
                frequency = options.pulser_freq,
                period = timing.period,
                range = timing.range,
                "pulser programmed"
            );
        }

        info!(link = options.link, crate_no = options.crate_no, "crate controller initialized");

        Ok(Self {
            link: Some(link),
            model,
            options: options.clone(),
            log,
        })
    }

    pub fn options(&self) -> &CrateOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Output bits raised by `send_start`
    pub fn enabled_outputs(&self) -> u32 {
        let outputs = self.model.outputs;
        [
            (self.options.s_in, outputs.s_in),
            (self.options.muon_veto, outputs.muon_veto),
            (self.options.neutron_veto, outputs.neutron_veto),
            (self.options.led_trigger, outputs.led_trigger),
            (self.options.pulser_freq > 0.0, outputs.pulser),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .fold(0, |mask, (_, bit)| mask | bit)
    }

    /// Raise the enabled outputs in a single write
    pub fn send_start(&mut self) -> Result<(), CrateError> {
        let mask = self.enabled_outputs();
        let reg = self.model.output_set;
        let Some(link) = self.link.as_mut() else {
            return Err(CrateError::Bus(BusError::Closed));
        };
        link.write_register(reg, mask)?;
        self.log.entry(
            &format!("Crate controller start signal sent (outputs {:#x})", mask),
            Severity::Debug,
        );
        Ok(())
    }

    /// Lower the outputs; with `end` the handle is released
    ///
    /// Stopping a released controller does nothing.
    pub fn send_stop(&mut self, end: bool) -> Result<(), CrateError> {
        let mask = self.enabled_outputs();
        let reg = self.model.output_clear;
        let result = match self.link.as_mut() {
            Some(link) => link.write_register(reg, mask).map_err(CrateError::from),
            None => return Ok(()),
        };
        if end {
            self.link = None;
            debug!(link = self.options.link, "crate controller released");
        }
        result
    }
}
