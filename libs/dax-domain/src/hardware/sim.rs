//! Simulated bus
//!
//! Register files plus a small acquisition-state emulation, enough to drive
//! every controller path without hardware. Boards start on software start or
//! on S-IN, which follows the output writes of any simulated crate
//! controller on the bus. While running, every readout produces a batch of
//! events from a deterministic generator.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::trace;

use super::models::{
    BoardModel, CrateModel, ACQ_SIN_START, ACQ_SOFTWARE_START, ACQ_STOP, EVENT_HEADER_MARKER,
    STATUS_BOARD_READY, STATUS_EVENT_READY, STATUS_RUNNING,
};
use super::{BoardLink, BusAddress, BusConnector, BusError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Encode one event the way a digitizer lays it out in its readout buffer
///
/// Every channel in `channel_mask` gets the same `samples` and a channel
/// time equal to `trigger_time`. An odd sample count is padded with a zero.
pub fn encode_event(
    model: &BoardModel,
    channel_mask: u32,
    trigger_time: u32,
    samples: &[u16],
) -> Vec<u32> {
    let clock_mask = model.clock.mask();
    let channel_mask = channel_mask & ((1u32 << model.n_channels) - 1);
    let header_words = model.format.channel_header_words;
    let sample_words: Vec<u32> = samples
        .chunks(2)
        .map(|pair| u32::from(pair[0]) | (u32::from(pair.get(1).copied().unwrap_or(0)) << 16))
        .collect();

    let enabled = channel_mask.count_ones() as usize;
    let total = 4 + enabled * (header_words + sample_words.len());

    let mut words = Vec::with_capacity(total);
    words.push((EVENT_HEADER_MARKER << 28) | (total as u32 & 0x0FFF_FFFF));
    words.push(channel_mask & 0xFF);
    words.push(match model.format.channel_mask_msb_idx {
        Some(_) => ((channel_mask >> 8) & 0xFF) << 24,
        None => 0,
    });
    words.push(trigger_time & clock_mask);

    for channel in 0..model.n_channels {
        if channel_mask & (1 << channel) == 0 {
            continue;
        }
        if header_words > 0 {
            words.push((header_words + sample_words.len()) as u32);
            words.push(trigger_time & clock_mask);
            words.extend(std::iter::repeat(0).take(header_words.saturating_sub(2)));
        }
        words.extend_from_slice(&sample_words);
    }
    words
}

/// Behaviour of one simulated board
#[derive(Debug, Clone)]
pub struct SimBoardConfig {
    pub model: &'static BoardModel,
    pub channel_mask: u32,
    pub events_per_read: usize,
    pub samples_per_channel: usize,
    /// Raw clock ticks between two generated events
    pub tick_step: u32,
    pub start_time: u32,
    pub unresponsive: bool,
    pub failing_reads: bool,
    pub corrupt: bool,
    pub read_stall: Option<Duration>,
}

impl SimBoardConfig {
    pub fn new(model: &'static BoardModel) -> Self {
        Self {
            model,
            channel_mask: (1u32 << model.n_channels) - 1,
            events_per_read: 4,
            samples_per_channel: 64,
            tick_step: 1_000_000,
            start_time: 0,
            unresponsive: false,
            failing_reads: false,
            corrupt: false,
            read_stall: None,
        }
    }

    /// Nothing answers at this address
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    /// Block transfers fail
    pub fn failing_reads(mut self) -> Self {
        self.failing_reads = true;
        self
    }

    /// Events claim more words than the buffer holds
    pub fn corrupt(mut self) -> Self {
        self.corrupt = true;
        self
    }

    /// Every block transfer blocks for `stall`
    pub fn stall_reads(mut self, stall: Duration) -> Self {
        self.read_stall = Some(stall);
        self
    }

    pub fn with_events(mut self, events_per_read: usize, tick_step: u32) -> Self {
        self.events_per_read = events_per_read;
        self.tick_step = tick_step;
        self
    }

    pub fn with_start_time(mut self, start_time: u32) -> Self {
        self.start_time = start_time;
        self
    }
}

#[derive(Debug)]
struct SimBoard {
    config: SimBoardConfig,
    registers: HashMap<u32, u32>,
    software_run: bool,
    sin_armed: bool,
    time: u32,
    served: bool,
    /// Software triggers waiting for the next transfer
    triggers: usize,
    s_in: Arc<AtomicBool>,
}

impl SimBoard {
    fn new(config: SimBoardConfig, s_in: Arc<AtomicBool>) -> Self {
        let time = config.start_time;
        Self {
            config,
            registers: HashMap::new(),
            software_run: false,
            sin_armed: false,
            time,
            served: false,
            triggers: 0,
            s_in,
        }
    }

    fn running(&self) -> bool {
        self.software_run || (self.sin_armed && self.s_in.load(Ordering::Acquire))
    }

    fn write(&mut self, reg: u32, value: u32) {
        let regs = self.config.model.registers;
        if reg == regs.reset {
            self.registers.clear();
            self.software_run = false;
            self.sin_armed = false;
            self.triggers = 0;
            return;
        }
        if reg == regs.sw_trigger && self.running() {
            self.triggers += 1;
        }
        if reg == regs.acq_control {
            match value {
                ACQ_SOFTWARE_START => self.software_run = true,
                ACQ_SIN_START => self.sin_armed = true,
                ACQ_STOP => {
                    self.software_run = false;
                    self.sin_armed = false;
                }
                _ => {}
            }
        }
        self.registers.insert(reg, value);
    }

    fn read(&self, reg: u32) -> u32 {
        let regs = self.config.model.registers;
        if reg == regs.acq_status {
            let mut status = STATUS_BOARD_READY;
            if self.running() {
                status |= STATUS_RUNNING;
                if self.config.events_per_read > 0 || self.triggers > 0 {
                    status |= STATUS_EVENT_READY;
                }
            }
            return status;
        }
        if reg == regs.board_info {
            return self.config.model.family_code;
        }
        self.registers.get(&reg).copied().unwrap_or(0)
    }

    fn block_read(&mut self, max_words: usize) -> Result<Vec<u32>, BusError> {
        if self.config.failing_reads {
            return Err(BusError::transfer("simulated transfer failure"));
        }
        if self.served || !self.running() {
            self.served = false;
            return Ok(Vec::new());
        }

        let samples: Vec<u16> = (0..self.config.samples_per_channel)
            .map(|i| 16_000 - (i as u16 % 32) * 8)
            .collect();
        let mask = self.config.model.clock.mask();
        let mut words = Vec::new();
        let events = self.config.events_per_read + mem::take(&mut self.triggers);
        for _ in 0..events {
            let mut event = encode_event(
                self.config.model,
                self.config.channel_mask,
                self.time,
                &samples,
            );
            if self.config.corrupt {
                event[0] = (EVENT_HEADER_MARKER << 28) | (event.len() as u32 * 4);
            }
            if words.len() + event.len() > max_words {
                break;
            }
            words.extend_from_slice(&event);
            self.time = self.time.wrapping_add(self.config.tick_step) & mask;
        }
        self.served = true;
        trace!(words = words.len(), time = self.time, "simulated block transfer");
        Ok(words)
    }
}

#[derive(Debug, Default)]
struct SimController {
    registers: HashMap<u32, u32>,
    outputs: u32,
}

#[derive(Debug)]
enum LinkTarget {
    Board(Arc<Mutex<SimBoard>>),
    Controller {
        state: Arc<Mutex<SimController>>,
        s_in: Arc<AtomicBool>,
    },
}

/// Link handed out by [`SimulatedBus`]
#[derive(Debug)]
pub struct SimulatedLink {
    target: LinkTarget,
}

impl BoardLink for SimulatedLink {
    fn write_register(&mut self, reg: u32, value: u32) -> Result<(), BusError> {
        match &self.target {
            LinkTarget::Board(board) => lock(board).write(reg, value),
            LinkTarget::Controller { state, s_in } => {
                let model = CrateModel::V2718;
                let mut state = lock(state);
                if reg == model.output_set {
                    state.outputs |= value;
                } else if reg == model.output_clear {
                    state.outputs &= !value;
                }
                s_in.store(state.outputs & model.outputs.s_in != 0, Ordering::Release);
                state.registers.insert(reg, value);
            }
        }
        Ok(())
    }

    fn read_register(&mut self, reg: u32) -> Result<u32, BusError> {
        Ok(match &self.target {
            LinkTarget::Board(board) => lock(board).read(reg),
            LinkTarget::Controller { state, .. } => {
                lock(state).registers.get(&reg).copied().unwrap_or(0)
            }
        })
    }

    fn block_read(&mut self, max_words: usize) -> Result<Vec<u32>, BusError> {
        match &self.target {
            LinkTarget::Board(board) => {
                let stall = lock(board).config.read_stall;
                if let Some(stall) = stall {
                    thread::sleep(stall);
                }
                lock(board).block_read(max_words)
            }
            LinkTarget::Controller { .. } => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Default)]
struct SimInner {
    boards: Mutex<HashMap<BusAddress, Arc<Mutex<SimBoard>>>>,
    controllers: Mutex<HashMap<(i32, i32), Arc<Mutex<SimController>>>>,
    s_in: Arc<AtomicBool>,
    permissive: Option<&'static BoardModel>,
}

/// In-process bus implementing [`BusConnector`]
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    inner: Arc<SimInner>,
}

impl SimulatedBus {
    /// Empty bus: only explicitly added boards answer
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus where any address answers as a board of `model`
    pub fn permissive(model: &'static BoardModel) -> Self {
        Self {
            inner: Arc::new(SimInner {
                permissive: Some(model),
                ..SimInner::default()
            }),
        }
    }

    pub fn add_board(&self, address: BusAddress, config: SimBoardConfig) {
        let board = SimBoard::new(config, Arc::clone(&self.inner.s_in));
        lock(&self.inner.boards).insert(address, Arc::new(Mutex::new(board)));
    }

    /// Last value written to a board register
    pub fn register(&self, address: BusAddress, reg: u32) -> Option<u32> {
        let board = lock(&self.inner.boards).get(&address).cloned()?;
        let value = lock(&board).registers.get(&reg).copied();
        value
    }

    /// Last value written to a crate controller register
    pub fn controller_register(&self, link: i32, crate_no: i32, reg: u32) -> Option<u32> {
        let controller = lock(&self.inner.controllers).get(&(link, crate_no)).cloned()?;
        let value = lock(&controller).registers.get(&reg).copied();
        value
    }

    /// Current crate controller output levels
    pub fn controller_outputs(&self, link: i32, crate_no: i32) -> u32 {
        lock(&self.inner.controllers)
            .get(&(link, crate_no))
            .map(|controller| lock(controller).outputs)
            .unwrap_or(0)
    }

    pub fn s_in_active(&self) -> bool {
        self.inner.s_in.load(Ordering::Acquire)
    }

    pub fn is_running(&self, address: BusAddress) -> bool {
        lock(&self.inner.boards)
            .get(&address)
            .map(|board| lock(board).running())
            .unwrap_or(false)
    }
}

impl BusConnector for SimulatedBus {
    type Link = SimulatedLink;

    fn open_board(&self, address: BusAddress) -> Result<Self::Link, BusError> {
        let mut boards = lock(&self.inner.boards);
        let board = match (boards.get(&address), self.inner.permissive) {
            (Some(board), _) => Arc::clone(board),
            (None, Some(model)) => {
                let board = Arc::new(Mutex::new(SimBoard::new(
                    SimBoardConfig::new(model),
                    Arc::clone(&self.inner.s_in),
                )));
                boards.insert(address, Arc::clone(&board));
                board
            }
            (None, None) => return Err(BusError::NoResponse(address)),
        };
        if lock(&board).config.unresponsive {
            return Err(BusError::NoResponse(address));
        }
        Ok(SimulatedLink {
            target: LinkTarget::Board(board),
        })
    }

    fn open_controller(&self, link: i32, crate_no: i32) -> Result<Self::Link, BusError> {
        let state = Arc::clone(
            lock(&self.inner.controllers)
                .entry((link, crate_no))
                .or_default(),
        );
        Ok(SimulatedLink {
            target: LinkTarget::Controller {
                state,
                s_in: Arc::clone(&self.inner.s_in),
            },
        })
    }
}
