//! Run controller
//!
//! Owns every board handle, the crate controller, the readout threads and
//! the pipeline of the current session. All methods block on hardware and
//! thread joins and are meant to be called from one control thread.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{ControllerError, RunState};
use crate::hardware::{
    BoardModel, BusAddress, BusConnector, CrateController, Digitizer, DigitizerError, PollPolicy,
};
use crate::logging::{Severity, SharedLog};
use crate::options::{BoardConfig, RunOptions, RunStart};
use crate::readout::{ReadoutWorker, RunCounters};
use crate::strax::{compressor_for, PipelineStats, StraxConfig, StraxPipeline};

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DaqController<C: BusConnector> {
    bus: C,
    host: String,
    log: SharedLog,
    state: RunState,
    options: Option<RunOptions>,
    poll: PollPolicy,
    digitizers: BTreeMap<i32, Vec<Digitizer<C::Link>>>,
    crate_controller: Option<CrateController<C::Link>>,
    pipeline: Option<Arc<StraxPipeline>>,
    workers: Vec<ReadoutWorker<C::Link>>,
    joining: Vec<ReadoutWorker<C::Link>>,
    error_flags: Vec<Arc<AtomicBool>>,
    running: Arc<AtomicBool>,
    counters: Arc<RunCounters>,
}

impl<C: BusConnector> DaqController<C> {
    pub fn new(bus: C, host: impl Into<String>, log: SharedLog) -> Self {
        Self {
            bus,
            host: host.into(),
            log,
            state: RunState::Idle,
            options: None,
            poll: PollPolicy::default(),
            digitizers: BTreeMap::new(),
            crate_controller: None,
            pipeline: None,
            workers: Vec::new(),
            joining: Vec::new(),
            error_flags: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(RunCounters::default()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn status(&self) -> RunState {
        self.state
    }

    /// Name of the armed options profile, `"none"` when nothing is armed
    pub fn run_mode(&self) -> String {
        self.options
            .as_ref()
            .map(|options| options.name.clone())
            .unwrap_or_else(|| "none".to_string())
    }

    /// Bytes read by all workers since the previous call
    pub fn data_size(&self) -> u64 {
        self.counters.take_bytes()
    }

    /// Bytes waiting in the pipeline for their chunk to close
    pub fn buffer_length(&self) -> u64 {
        self.pipeline
            .as_ref()
            .map(|pipeline| pipeline.buffered_bytes())
            .unwrap_or(0)
    }

    pub fn pipeline_stats(&self) -> Option<PipelineStats> {
        self.pipeline.as_ref().map(|pipeline| pipeline.stats())
    }

    /// Readout threads left over from a stop that timed out
    pub fn joining_workers(&self) -> usize {
        self.joining.len()
    }

    /// Health of the session: any board, pipeline or thread in trouble
    pub fn check_errors(&self) -> bool {
        let boards = self
            .error_flags
            .iter()
            .any(|flag| flag.load(Ordering::Acquire));
        let pipeline = self
            .pipeline
            .as_ref()
            .map_or(false, |pipeline| pipeline.check_error());
        boards || pipeline || !self.joining.is_empty()
    }

    /// Tear down any previous session and configure a new one
    ///
    /// The controller passes through `Arming` and ends `Armed` once every
    /// board addressed to this host is configured, the crate controller (if
    /// this host drives it) is initialized and the pipeline is created.
    ///
    /// # Arguments
    ///
    /// * `profile` - The stored options document
    /// * `override_doc` - Merged over the profile, its values win
    ///
    /// # Errors
    ///
    /// - `ControllerError::InvalidState` while a run is in progress
    /// - `ControllerError::WorkersStillJoining` while readout threads of a
    ///   previous run have not finished
    /// - `ControllerError::Options` if the merged document is invalid
    /// - `ControllerError::NoBoards` if nothing is addressed to this host
    /// - `ControllerError::BoardInit` naming every board that failed
    ///
    /// Any failure leaves the controller `Idle` with nothing held.
    #[instrument(skip_all, fields(host = %self.host))]
    pub fn arm(&mut self, profile: Value, override_doc: Option<Value>) -> Result<(), ControllerError> {
        if self.state == RunState::Running {
            return Err(ControllerError::invalid_state("arm", self.state));
        }
        let still_joining = self.reap_workers();
        if still_joining > 0 {
            self.log.entry(
                &format!(
                    "Cannot arm while {} readout thread(s) from the previous run are active",
                    still_joining
                ),
                Severity::Warning,
            );
            return Err(ControllerError::WorkersStillJoining(still_joining));
        }

        self.end();
        self.state = RunState::Arming;

        let result = RunOptions::resolve(profile, override_doc)
            .map_err(ControllerError::from)
            .and_then(|options| self.initialize(options));

        match result {
            Ok(()) => {
                self.state = RunState::Armed;
                Ok(())
            }
            Err(e) => {
                let severity = match e {
                    ControllerError::Options(_) => Severity::Warning,
                    _ => Severity::Error,
                };
                self.log.entry(&format!("Arm failed: {}", e), severity);
                self.end();
                Err(e)
            }
        }
    }

    fn initialize(&mut self, options: RunOptions) -> Result<(), ControllerError> {
        let boards: Vec<BoardConfig> = options.boards_for_host(&self.host).cloned().collect();
        let crate_options = options.crate_for_host(&self.host).cloned();
        if boards.is_empty() && crate_options.is_none() {
            return Err(ControllerError::NoBoards(self.host.clone()));
        }

        self.poll = PollPolicy::new(
            options.readout.poll_tries,
            Duration::from_millis(options.readout.poll_delay_ms),
        );

        let mut failed = Vec::new();
        for board in &boards {
            match self.init_board(board, &options) {
                Ok(digitizer) => {
                    self.error_flags.push(digitizer.error_flag());
                    self.digitizers
                        .entry(board.link)
                        .or_default()
                        .push(digitizer);
                }
                Err(e) => {
                    self.log.entry(
                        &format!("Failed to initialize board {}: {}", board.board, e),
                        Severity::Error,
                    );
                    failed.push(board.board);
                }
            }
        }
        if !failed.is_empty() {
            return Err(ControllerError::BoardInit { boards: failed });
        }

        if let Some(crate_options) = &crate_options {
            self.crate_controller = Some(CrateController::init(
                &self.bus,
                crate_options,
                Arc::clone(&self.log),
            )?);
        }

        let compressor = compressor_for(&options.strax.compressor)?;
        self.pipeline = Some(Arc::new(StraxPipeline::new(
            StraxConfig::from_options(&options, &self.host),
            compressor,
            Arc::clone(&self.log),
        )));
        self.counters = Arc::new(RunCounters::default());

        let links = options.links_for_host(&self.host);
        self.log.entry(
            &format!(
                "Armed {} board(s) on links {:?} with mode {}",
                boards.len(),
                links,
                options.name
            ),
            Severity::Message,
        );
        self.options = Some(options);
        Ok(())
    }

    fn init_board(
        &self,
        board: &BoardConfig,
        options: &RunOptions,
    ) -> Result<Digitizer<C::Link>, DigitizerError> {
        let bid = board.board;
        // Types are checked when options resolve
        let model = board.model().unwrap_or(&BoardModel::V1724);
        let address = BusAddress::new(board.link, board.crate_no, board.vme_address.0);

        let mut digitizer = Digitizer::init(&self.bus, model, address, bid, Arc::clone(&self.log))?
            .with_max_block_reads(options.readout.max_block_reads);

        digitizer.acquisition_stop()?;
        for setting in options.registers_for(bid) {
            digitizer.write_register(setting.reg.0, setting.val.0)?;
        }
        if let Some(dac) = options.dac_for(bid) {
            let mut values = dac.to_vec();
            if let Some(calibration) = options.calibration_for(bid) {
                digitizer.clamp_dac_values(&mut values, calibration);
            }
            digitizer.load_dac(&values, self.poll)?;
        }
        if let Some(thresholds) = options.thresholds_for(bid) {
            digitizer.set_thresholds(thresholds)?;
        }
        digitizer.ensure_ready(self.poll)?;
        if options.run_start == RunStart::SIn {
            digitizer.sin_start()?;
        }

        debug!(board = bid, link = board.link, "board configured");
        Ok(digitizer)
    }

    /// Start acquisition and one readout thread per link
    ///
    /// With a software start every board is started and checked before the
    /// threads spawn. With an S-IN start the boards are already armed and the
    /// crate controller raises the signal once the threads are reading.
    ///
    /// # Errors
    ///
    /// - `ControllerError::InvalidState` unless the controller is `Armed`
    /// - `ControllerError::BoardStart` naming the boards that did not start
    /// - `ControllerError::Spawn` or `ControllerError::Crate` if a readout
    ///   thread or the start signal fails
    ///
    /// On error the run is stopped and the controller is `Idle`.
    #[instrument(skip_all, fields(host = %self.host))]
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.state != RunState::Armed {
            return Err(ControllerError::invalid_state("start", self.state));
        }
        let (Some(pipeline), Some(options)) = (self.pipeline.clone(), self.options.as_ref()) else {
            return Err(ControllerError::invalid_state("start", self.state));
        };
        let run_start = options.run_start;
        let idle_sleep = Duration::from_micros(options.readout.idle_sleep_us);

        if run_start == RunStart::Software {
            let poll = self.poll;
            let failed: Vec<i32> = self
                .digitizers
                .values_mut()
                .flatten()
                .filter_map(|digitizer| {
                    digitizer
                        .software_start()
                        .and_then(|_| digitizer.ensure_started(poll))
                        .err()
                        .map(|e| {
                            warn!(board = digitizer.bid(), error = %e, "board did not start");
                            digitizer.bid()
                        })
                })
                .collect();
            if !failed.is_empty() {
                self.log.entry(
                    &format!("Boards {:?} failed to start", failed),
                    Severity::Error,
                );
                self.stop();
                return Err(ControllerError::BoardStart { boards: failed });
            }
        }

        self.running.store(true, Ordering::Release);
        for (link, digitizers) in mem::take(&mut self.digitizers) {
            let spawned = ReadoutWorker::spawn(
                link,
                digitizers,
                Arc::clone(&pipeline),
                Arc::clone(&self.running),
                Arc::clone(&self.counters),
                idle_sleep,
            );
            match spawned {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    self.log.entry(
                        &format!("Failed to start readout thread for link {}: {}", link, e),
                        Severity::Error,
                    );
                    self.stop();
                    return Err(e.into());
                }
            }
        }

        if run_start == RunStart::SIn {
            match self.crate_controller.as_mut() {
                Some(crate_controller) => {
                    if let Err(e) = crate_controller.send_start() {
                        self.log
                            .entry(&format!("Crate start signal failed: {}", e), Severity::Error);
                        self.stop();
                        return Err(e.into());
                    }
                }
                None => debug!("no crate controller on this node, waiting for S-IN"),
            }
        }

        self.state = RunState::Running;
        let links: Vec<i32> = self.workers.iter().map(ReadoutWorker::link).collect();
        self.log.entry(
            &format!("Run started, reading links {:?}", links),
            Severity::Message,
        );
        Ok(())
    }

    /// Stop acquisition, join the readout threads and close the pipeline
    ///
    /// The crate signal is lowered first, then the threads are told to stop
    /// and joined for at most `readout.join_timeout_ms`. Threads still
    /// running after that are logged at Error and kept until
    /// [`reap_workers`](Self::reap_workers) collects them. Closing the
    /// pipeline flushes every open chunk and writes the end marker.
    ///
    /// Never fails: hardware errors are logged. Always ends `Idle`; calling
    /// it again does nothing new.
    #[instrument(skip_all, fields(host = %self.host))]
    pub fn stop(&mut self) {
        if let Some(crate_controller) = self.crate_controller.as_mut() {
            if let Err(e) = crate_controller.send_stop(false) {
                self.log
                    .entry(&format!("Crate stop signal failed: {}", e), Severity::Warning);
            }
        }

        self.running.store(false, Ordering::Release);
        self.join_workers();

        let poll = self.poll;
        for digitizer in self.digitizers.values_mut().flatten() {
            let stopped = digitizer
                .acquisition_stop()
                .and_then(|_| digitizer.ensure_stopped(poll));
            if let Err(e) = stopped {
                warn!(board = digitizer.bid(), error = %e, "board did not stop");
            }
        }

        if let Some(pipeline) = &self.pipeline {
            if !pipeline.is_closed() {
                for (bid, failures) in pipeline.close() {
                    self.log.entry(
                        &format!("Board {} had {} failed readouts this run", bid, failures),
                        Severity::Warning,
                    );
                }
            }
        }

        if self.state == RunState::Running {
            self.log.entry("Run stopped", Severity::Message);
        }
        self.state = RunState::Idle;
    }

    fn join_timeout(&self) -> Duration {
        self.options
            .as_ref()
            .map(|options| Duration::from_millis(options.readout.join_timeout_ms))
            .unwrap_or(DEFAULT_JOIN_TIMEOUT)
    }

    fn join_workers(&mut self) {
        let deadline = Instant::now() + self.join_timeout();
        while self.workers.iter().any(|worker| !worker.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        for worker in mem::take(&mut self.workers) {
            let link = worker.link();
            if !worker.is_finished() {
                self.log.entry(
                    &format!(
                        "Readout thread for link {} did not finish within {} ms",
                        link,
                        self.join_timeout().as_millis()
                    ),
                    Severity::Error,
                );
                self.joining.push(worker);
                continue;
            }
            match worker.join() {
                Some(digitizers) => self.digitizers.entry(link).or_default().extend(digitizers),
                None => self.log.entry(
                    &format!("Readout thread for link {} panicked", link),
                    Severity::Error,
                ),
            }
        }
    }

    /// Collect readout threads that finished after their stop timed out
    ///
    /// Returns how many are still running.
    pub fn reap_workers(&mut self) -> usize {
        let (done, pending): (Vec<_>, Vec<_>) = mem::take(&mut self.joining)
            .into_iter()
            .partition(|worker| worker.is_finished());
        self.joining = pending;

        for worker in done {
            let link = worker.link();
            if let Some(mut digitizers) = worker.join() {
                for digitizer in &mut digitizers {
                    if let Err(e) = digitizer.acquisition_stop() {
                        debug!(board = digitizer.bid(), error = %e, "stop after late join failed");
                    }
                    digitizer.end();
                }
            }
            self.log.entry(
                &format!("Readout thread for link {} finished late", link),
                Severity::Message,
            );
        }
        self.joining.len()
    }

    /// Forced teardown from any state
    pub fn end(&mut self) {
        if self.state == RunState::Running || !self.workers.is_empty() {
            self.stop();
        }

        for digitizer in self.digitizers.values_mut().flatten() {
            if let Err(e) = digitizer.acquisition_stop() {
                debug!(board = digitizer.bid(), error = %e, "stop before release failed");
            }
            digitizer.end();
        }
        self.digitizers.clear();

        if let Some(mut crate_controller) = self.crate_controller.take() {
            if let Err(e) = crate_controller.send_stop(true) {
                warn!(error = %e, "crate controller release failed");
            }
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.close();
        }

        if self.options.take().is_some() {
            info!(host = %self.host, "session ended");
        }
        self.error_flags.clear();
        self.state = RunState::Idle;
    }
}

impl<C: BusConnector> Drop for DaqController<C> {
    fn drop(&mut self) {
        self.end();
    }
}
