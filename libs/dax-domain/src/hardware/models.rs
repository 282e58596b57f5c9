//! Board models as data
//!
//! Every supported digitizer shares one driver; what differs between
//! models is captured here.

use crate::clock::ClockSpec;

/// Acquisition status: acquisition running
pub const STATUS_RUNNING: u32 = 0x4;
/// Acquisition status: at least one event is ready for readout
pub const STATUS_EVENT_READY: u32 = 0x8;
/// Acquisition status: board ready to start
pub const STATUS_BOARD_READY: u32 = 0x100;
/// Channel status: DAC update in progress
pub const CHANNEL_DAC_BUSY: u32 = 0x4;

/// Acquisition control: arm and start on the S-IN front panel signal
pub const ACQ_SIN_START: u32 = 0x105;
/// Acquisition control: start now
pub const ACQ_SOFTWARE_START: u32 = 0x104;
/// Acquisition control: stop
pub const ACQ_STOP: u32 = 0x100;

/// Event header word 1: the board flagged an internal failure
pub const BOARD_FAIL_BIT: u32 = 0x0400_0000;
/// Marker nibble of an event header
pub const EVENT_HEADER_MARKER: u32 = 0xA;

/// Register offsets of a digitizer model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub acq_control: u32,
    pub acq_status: u32,
    pub sw_trigger: u32,
    pub reset: u32,
    pub board_info: u32,
    /// Per-channel registers are `base + channel * channel_stride`
    pub channel_status: u32,
    pub channel_dac: u32,
    pub channel_threshold: u32,
    pub channel_stride: u32,
}

impl RegisterMap {
    pub fn channel(&self, base: u32, channel: u32) -> u32 {
        base + channel * self.channel_stride
    }
}

/// Layout of the readout buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFormat {
    /// Words of per-channel header preceding each channel's samples (0 when
    /// the firmware writes fixed-size channel blocks without a header)
    pub channel_header_words: usize,
    /// Nanoseconds per ADC sample
    pub ns_per_sample: u16,
    /// Event header word whose top byte holds channel mask bits 8..15
    pub channel_mask_msb_idx: Option<usize>,
}

/// Everything that differs between digitizer models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardModel {
    pub name: &'static str,
    pub n_channels: u32,
    /// Largest baseline the ADC can represent
    pub adc_max: u16,
    /// Value of the board-info register's family byte
    pub family_code: u32,
    pub registers: RegisterMap,
    pub format: DataFormat,
    pub clock: ClockSpec,
}

const V1724_REGISTERS: RegisterMap = RegisterMap {
    acq_control: 0x8100,
    acq_status: 0x8104,
    sw_trigger: 0x8108,
    reset: 0xEF24,
    board_info: 0x8140,
    channel_status: 0x1088,
    channel_dac: 0x1098,
    channel_threshold: 0x1060,
    channel_stride: 0x100,
};

impl BoardModel {
    /// V1724 running the DAW firmware
    pub const V1724: BoardModel = BoardModel {
        name: "V1724",
        n_channels: 8,
        adc_max: 0x3fff,
        family_code: 0x04,
        registers: V1724_REGISTERS,
        format: DataFormat {
            channel_header_words: 2,
            ns_per_sample: 10,
            channel_mask_msb_idx: None,
        },
        clock: ClockSpec::V1724,
    };

    /// V1724 on the muon veto, standard firmware without channel headers
    pub const V1724_MV: BoardModel = BoardModel {
        name: "V1724_MV",
        n_channels: 8,
        adc_max: 0x3fff,
        family_code: 0x04,
        registers: RegisterMap {
            channel_threshold: 0x1080,
            ..V1724_REGISTERS
        },
        format: DataFormat {
            channel_header_words: 0,
            ns_per_sample: 10,
            channel_mask_msb_idx: None,
        },
        clock: ClockSpec::V1724,
    };

    /// 16-channel V1730
    pub const V1730: BoardModel = BoardModel {
        name: "V1730",
        n_channels: 16,
        adc_max: 0x3fff,
        family_code: 0x0B,
        registers: V1724_REGISTERS,
        format: DataFormat {
            channel_header_words: 2,
            ns_per_sample: 2,
            channel_mask_msb_idx: Some(2),
        },
        clock: ClockSpec::V1730,
    };

    const ALL: [&'static BoardModel; 3] = [&Self::V1724, &Self::V1724_MV, &Self::V1730];

    /// Look a model up by the `type` string used in run options
    pub fn from_type(name: &str) -> Option<&'static BoardModel> {
        Self::ALL
            .iter()
            .copied()
            .find(|model| model.name.eq_ignore_ascii_case(name))
    }
}

/// V2718 output bits (output register bits 6..10 drive outputs 0..4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrateOutputs {
    pub s_in: u32,
    pub led_trigger: u32,
    pub muon_veto: u32,
    pub neutron_veto: u32,
    pub pulser: u32,
}

/// Register offsets of a crate controller model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrateModel {
    pub name: &'static str,
    pub output_set: u32,
    pub output_clear: u32,
    pub output_mux_set: u32,
    pub pulser_a_timing: u32,
    pub pulser_a_range: u32,
    pub outputs: CrateOutputs,
    /// Pulser time units in ns, selected by the range field
    pub pulser_units_ns: [u64; 4],
}

impl CrateModel {
    pub const V2718: CrateModel = CrateModel {
        name: "V2718",
        output_set: 0x0A,
        output_clear: 0x10,
        output_mux_set: 0x0C,
        pulser_a_timing: 0x16,
        pulser_a_range: 0x17,
        outputs: CrateOutputs {
            s_in: 0x040,
            led_trigger: 0x080,
            muon_veto: 0x100,
            neutron_veto: 0x200,
            pulser: 0x400,
        },
        pulser_units_ns: [25, 1_600, 410_000, 104_000_000],
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_type_is_case_insensitive() {
        assert_eq!(BoardModel::from_type("v1730").map(|m| m.n_channels), Some(16));
        assert_eq!(BoardModel::from_type("V1724_MV").map(|m| m.name), Some("V1724_MV"));
        assert!(BoardModel::from_type("V792").is_none());
    }

    #[test]
    fn test_channel_registers_are_strided() {
        let regs = BoardModel::V1724.registers;
        assert_eq!(regs.channel(regs.channel_dac, 0), 0x1098);
        assert_eq!(regs.channel(regs.channel_dac, 3), 0x1398);
    }

    #[test]
    fn test_muon_veto_differs_only_in_data() {
        let mv = BoardModel::V1724_MV;
        assert_eq!(mv.registers.acq_control, BoardModel::V1724.registers.acq_control);
        assert_ne!(
            mv.registers.channel_threshold,
            BoardModel::V1724.registers.channel_threshold
        );
        assert_eq!(mv.format.channel_header_words, 0);
    }
}
