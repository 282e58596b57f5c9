//! Command processor
//!
//! The control loop of a readout node. Each tick it acknowledges and applies
//! the commands addressed to this node, purges every command the whole
//! fleet has acknowledged, and writes one status report.
//!
//! Controller operations block on hardware and thread joins. They run under
//! `tokio::task::block_in_place`, so the processor needs the multi-threaded
//! runtime.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::block_in_place;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::command::Command;
use super::document::StatusReport;
use super::ports::{DocumentStore, StoreError};
use crate::controller::{DaqController, RunState};
use crate::hardware::BusConnector;
use crate::logging::{Severity, SharedLog};
use crate::options::OptionsError;

const NO_RUN: &str = "none";

/// Outcome of one pass over the control collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Commands addressed to this node and not yet acknowledged by it
    pub seen: usize,
    /// Commands that changed the run state
    pub applied: usize,
    /// Malformed, unknown or inapplicable commands
    pub ignored: usize,
    /// Commands deleted because every addressed node acknowledged them
    pub purged: usize,
}

pub struct CommandProcessor<S, C: BusConnector> {
    store: S,
    controller: DaqController<C>,
    log: SharedLog,
    current_run_id: String,
    last_report: Instant,
}

impl<S, C> CommandProcessor<S, C>
where
    S: DocumentStore,
    C: BusConnector,
{
    pub fn new(store: S, controller: DaqController<C>, log: SharedLog) -> Self {
        Self {
            store,
            controller,
            log,
            current_run_id: NO_RUN.to_string(),
            last_report: Instant::now(),
        }
    }

    pub fn host(&self) -> &str {
        self.controller.host()
    }

    pub fn controller(&self) -> &DaqController<C> {
        &self.controller
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn current_run_id(&self) -> &str {
        &self.current_run_id
    }

    /// Acknowledge, apply and purge the pending commands once
    #[instrument(skip(self), fields(host = %self.controller.host()))]
    pub async fn poll_once(&mut self) -> Result<PollSummary, StoreError> {
        let host = self.controller.host().to_string();
        let commands = self.store.pending_commands(&host).await?;
        let mut summary = PollSummary {
            seen: commands.len(),
            ..PollSummary::default()
        };

        for doc in commands {
            // Acknowledge before applying so a bad command never holds the barrier
            if !self.store.acknowledge(&doc.id, &host).await? {
                debug!(id = %doc.id, "command vanished before acknowledgment");
                summary.ignored += 1;
                continue;
            }

            let applied = match Command::parse(&doc) {
                Ok(command) => {
                    info!(id = %doc.id, command = command.name(), "applying command");
                    self.apply(command).await
                }
                Err(e) => {
                    self.log.entry(
                        &format!("Ignoring control document {}: {}", doc.id, e),
                        Severity::Warning,
                    );
                    false
                }
            };
            if applied {
                summary.applied += 1;
            } else {
                summary.ignored += 1;
            }
        }

        summary.purged = self.store.purge_acknowledged().await?;
        if summary.seen > 0 || summary.purged > 0 {
            debug!(?summary, "control poll done");
        }
        Ok(summary)
    }

    async fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Arm {
                mode,
                options_override,
            } => {
                let profile = match self.resolve_mode(mode).await {
                    Ok(profile) => profile,
                    Err(e) => {
                        self.log
                            .entry(&format!("Cannot arm: {}", e), Severity::Warning);
                        return false;
                    }
                };
                let controller = &mut self.controller;
                block_in_place(|| controller.arm(profile, options_override)).is_ok()
            }
            Command::Start { run_identifier } => {
                let state = self.controller.status();
                if state != RunState::Armed {
                    self.log.entry(
                        &format!("Ignoring start for run {} while {}", run_identifier, state),
                        Severity::Warning,
                    );
                    return false;
                }
                let controller = &mut self.controller;
                match block_in_place(|| controller.start()) {
                    Ok(()) => {
                        self.current_run_id = run_identifier;
                        true
                    }
                    Err(e) => {
                        self.log
                            .entry(&format!("Failed to start run: {}", e), Severity::Error);
                        false
                    }
                }
            }
            Command::Stop => {
                let controller = &mut self.controller;
                block_in_place(|| controller.stop());
                self.current_run_id = NO_RUN.to_string();
                true
            }
        }
    }

    async fn resolve_mode(&self, mode: Option<String>) -> Result<serde_json::Value, ArmRejection> {
        let mode = mode.ok_or(OptionsError::MissingMode)?;
        self.store
            .find_options(&mode)
            .await?
            .ok_or_else(|| OptionsError::NotFound(mode).into())
    }

    /// Write one status report
    pub async fn publish_status(&mut self) -> Result<StatusReport, StoreError> {
        let late = self.controller.reap_workers();
        if late > 0 {
            debug!(late, "readout threads still joining");
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_report).as_secs_f64();
        self.last_report = now;
        let bytes = self.controller.data_size() as f64;
        let rate = if elapsed > 0.0 {
            bytes / 1e6 / elapsed
        } else {
            0.0
        };

        let report = StatusReport {
            host: self.controller.host().to_string(),
            rate,
            status: self.controller.status(),
            buffer_length: self.controller.buffer_length() as f64 / 1e6,
            run_mode: self.controller.run_mode(),
            current_run_id: self.current_run_id.clone(),
            time: Utc::now(),
            error: self.controller.check_errors(),
        };
        self.store.insert_status(&report).await?;
        Ok(report)
    }

    /// Run the control loop until `shutdown` resolves, then tear the session down
    pub async fn run(&mut self, interval: Duration, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(host = %self.host(), interval_ms = interval.as_millis() as u64, "control loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "control poll failed");
                    }
                    if let Err(e) = self.publish_status().await {
                        warn!(error = %e, "status report failed");
                    }
                }
            }
        }

        info!(host = %self.host(), "control loop stopping");
        let controller = &mut self.controller;
        block_in_place(|| controller.end());
    }
}

/// Why an arm command was not passed to the controller
#[derive(Debug, thiserror::Error)]
enum ArmRejection {
    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error("options lookup failed: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::document::{ControlDocument, DocumentId, LogEntry};
    use crate::hardware::sim::{SimBoardConfig, SimulatedBus};
    use crate::hardware::{BoardModel, BusAddress};
    use crate::logging::{MockLogSink, TracingSink};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    // In-memory store shared between the processors of one test
    #[derive(Clone, Default)]
    struct InMemoryStore {
        commands: Arc<Mutex<Vec<ControlDocument>>>,
        options: Arc<Mutex<HashMap<String, Value>>>,
        status: Arc<Mutex<Vec<StatusReport>>>,
    }

    impl DocumentStore for InMemoryStore {
        fn pending_commands(
            &self,
            host: &str,
        ) -> impl Future<Output = Result<Vec<ControlDocument>, StoreError>> + Send {
            let pending: Vec<ControlDocument> = self
                .commands
                .lock()
                .unwrap()
                .iter()
                .filter(|doc| doc.is_addressed_to(host) && !doc.is_acknowledged_by(host))
                .cloned()
                .collect();
            async move { Ok(pending) }
        }

        fn acknowledge(
            &self,
            id: &DocumentId,
            host: &str,
        ) -> impl Future<Output = Result<bool, StoreError>> + Send {
            let mut commands = self.commands.lock().unwrap();
            let found = commands
                .iter_mut()
                .find(|doc| doc.id == *id)
                .map(|doc| doc.acknowledge(host))
                .is_some();
            async move { Ok(found) }
        }

        fn purge_acknowledged(&self) -> impl Future<Output = Result<usize, StoreError>> + Send {
            let mut commands = self.commands.lock().unwrap();
            let before = commands.len();
            commands.retain(|doc| !doc.is_complete());
            let purged = before - commands.len();
            async move { Ok(purged) }
        }

        fn find_options(
            &self,
            name: &str,
        ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send {
            let profile = self.options.lock().unwrap().get(name).cloned();
            async move { Ok(profile) }
        }

        fn insert_status(
            &self,
            report: &StatusReport,
        ) -> impl Future<Output = Result<(), StoreError>> + Send {
            self.status.lock().unwrap().push(report.clone());
            async move { Ok(()) }
        }

        fn insert_log(&self, _entry: &LogEntry) -> impl Future<Output = Result<(), StoreError>> + Send {
            async move { Ok(()) }
        }

        fn insert_command(
            &self,
            command: &ControlDocument,
        ) -> impl Future<Output = Result<(), StoreError>> + Send {
            self.commands.lock().unwrap().push(command.clone());
            async move { Ok(()) }
        }

        fn insert_options(&self, profile: Value) -> impl Future<Output = Result<(), StoreError>> + Send {
            let name = profile["name"].as_str().unwrap_or_default().to_string();
            self.options.lock().unwrap().insert(name, profile);
            async move { Ok(()) }
        }
    }

    impl InMemoryStore {
        fn command_count(&self) -> usize {
            self.commands.lock().unwrap().len()
        }

        fn acknowledged(&self) -> Vec<Vec<String>> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .map(|doc| doc.acknowledged.clone())
                .collect()
        }
    }

    fn profile(output: &std::path::Path) -> Value {
        json!({
            "name": "background",
            "run_start": 1,
            "boards": [
                {"link": 0, "crate": 0, "board": 100, "vme_address": "80000000", "type": "V1724", "host": "reader0"}
            ],
            "strax": {"output_path": output, "chunk_length": 100000000, "chunk_overlap": 1000000, "compressor": "none"},
            "readout": {"poll_tries": 20, "join_timeout_ms": 2000}
        })
    }

    fn processor(
        store: &InMemoryStore,
        host: &str,
        log: SharedLog,
    ) -> CommandProcessor<InMemoryStore, SimulatedBus> {
        let bus = SimulatedBus::new();
        bus.add_board(
            BusAddress::new(0, 0, 0x8000_0000),
            SimBoardConfig::new(&BoardModel::V1724),
        );
        let controller = DaqController::new(bus, host, Arc::clone(&log));
        CommandProcessor::new(store.clone(), controller, log)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_cycle_through_commands() {
        let dir = TempDir::new().unwrap();
        let store = InMemoryStore::default();
        store.insert_options(profile(dir.path())).await.unwrap();
        let mut node = processor(&store, "reader0", TracingSink::shared("reader0"));

        store
            .insert_command(&ControlDocument::new("arm", ["reader0"]).with_mode("background"))
            .await
            .unwrap();
        let summary = node.poll_once().await.unwrap();
        assert_eq!(
            summary,
            PollSummary {
                seen: 1,
                applied: 1,
                ignored: 0,
                purged: 1
            }
        );
        assert_eq!(node.controller().status(), RunState::Armed);

        store
            .insert_command(&ControlDocument::new("start", ["reader0"]).with_run_identifier(42))
            .await
            .unwrap();
        node.poll_once().await.unwrap();
        assert_eq!(node.current_run_id(), "42");

        let report = node.publish_status().await.unwrap();
        assert_eq!(report.status, RunState::Running);
        assert_eq!(report.run_mode, "background");
        assert_eq!(report.current_run_id, "42");
        assert!(!report.error);

        store
            .insert_command(&ControlDocument::new("stop", ["reader0"]))
            .await
            .unwrap();
        node.poll_once().await.unwrap();
        assert_eq!(node.controller().status(), RunState::Idle);
        assert_eq!(node.current_run_id(), "none");
        assert_eq!(store.status.lock().unwrap().len(), 1);
        assert_eq!(store.command_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_command_waits_for_every_addressed_node() {
        let store = InMemoryStore::default();
        let mut a = processor(&store, "a", TracingSink::shared("a"));
        let mut b = processor(&store, "b", TracingSink::shared("b"));
        store
            .insert_command(&ControlDocument::new("stop", ["a", "b"]))
            .await
            .unwrap();

        let first = b.poll_once().await.unwrap();
        assert_eq!(first.purged, 0);
        assert_eq!(store.acknowledged(), vec![vec!["b".to_string()]]);

        // Seen once per node
        assert_eq!(b.poll_once().await.unwrap().seen, 0);

        let second = a.poll_once().await.unwrap();
        assert_eq!(second.seen, 1);
        assert_eq!(second.purged, 1);
        assert_eq!(store.command_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_command_is_acknowledged_and_ignored() {
        let store = InMemoryStore::default();
        let mut log = MockLogSink::new();
        log.expect_entry()
            .withf(|msg, severity| *severity == Severity::Warning && msg.contains("reboot"))
            .times(1)
            .return_const(());
        log.expect_entry()
            .withf(|msg, _| !msg.contains("reboot"))
            .returning(|_, _| ());
        let mut node = processor(&store, "reader0", Arc::new(log));
        store
            .insert_command(&ControlDocument::new("reboot", ["reader0"]))
            .await
            .unwrap();

        let summary = node.poll_once().await.unwrap();

        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.purged, 1);
        assert_eq!(node.controller().status(), RunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_mode_warns_and_keeps_state() {
        let store = InMemoryStore::default();
        let mut log = MockLogSink::new();
        log.expect_entry()
            .withf(|_, severity| *severity >= Severity::Error)
            .never();
        log.expect_entry()
            .withf(|msg, severity| *severity == Severity::Warning && msg.contains("not_a_mode"))
            .times(1)
            .return_const(());
        log.expect_entry()
            .withf(|msg, severity| {
                *severity < Severity::Warning
                    || (*severity == Severity::Warning && !msg.contains("not_a_mode"))
            })
            .returning(|_, _| ());
        let mut node = processor(&store, "reader0", Arc::new(log));
        store
            .insert_command(&ControlDocument::new("arm", ["reader0"]).with_mode("not_a_mode"))
            .await
            .unwrap();

        let summary = node.poll_once().await.unwrap();

        assert_eq!(summary.ignored, 1);
        assert_eq!(node.controller().status(), RunState::Idle);
        assert_eq!(node.controller().run_mode(), "none");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_is_ignored_unless_armed() {
        let store = InMemoryStore::default();
        let mut node = processor(&store, "reader0", TracingSink::shared("reader0"));
        store
            .insert_command(&ControlDocument::new("start", ["reader0"]).with_run_identifier("r1"))
            .await
            .unwrap();

        let summary = node.poll_once().await.unwrap();

        assert_eq!(summary.applied, 0);
        assert_eq!(summary.ignored, 1);
        assert_eq!(node.current_run_id(), "none");
        assert_eq!(node.controller().status(), RunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_stops_on_shutdown() {
        let store = InMemoryStore::default();
        let mut node = processor(&store, "reader0", TracingSink::shared("reader0"));

        node.run(Duration::from_millis(5), tokio::time::sleep(Duration::from_millis(30)))
            .await;

        assert!(!store.status.lock().unwrap().is_empty());
        assert_eq!(node.controller().status(), RunState::Idle);
    }
}
