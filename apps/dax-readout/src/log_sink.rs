//! Log sink persisting entries to the store's `log` collection
//!
//! `entry` is called from readout threads, so it only mirrors the message to
//! tracing and queues it. A forwarder task writes the queue to the store.
//! A `Fatal` entry is written first, then reported on the fatal channel so
//! the main loop can shut down.

use std::sync::Arc;

use dax_domain::control::{DocumentStore, LogEntry};
use dax_domain::{LogSink, Severity, TracingSink};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, warn};

pub struct StoreLogSink {
    host: String,
    mirror: TracingSink,
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl StoreLogSink {
    /// Start the forwarder task
    ///
    /// The receiver resolves with the message of the first `Fatal` entry.
    pub fn spawn<S>(store: S, host: &str) -> (Arc<Self>, JoinHandle<()>, oneshot::Receiver<String>)
    where
        S: DocumentStore + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward(store, rx, fatal_tx));
        let sink = Arc::new(Self {
            host: host.to_string(),
            mirror: TracingSink::new(host),
            tx,
        });
        (sink, forwarder, fatal_rx)
    }
}

impl LogSink for StoreLogSink {
    fn entry(&self, message: &str, severity: Severity) {
        self.mirror.entry(message, severity);
        if self
            .tx
            .send(LogEntry::new(&self.host, message, severity))
            .is_err()
        {
            warn!("log forwarder stopped, entry not persisted");
        }
    }
}

async fn forward<S: DocumentStore>(
    store: S,
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    fatal_tx: oneshot::Sender<String>,
) {
    let mut fatal_tx = Some(fatal_tx);
    while let Some(entry) = rx.recv().await {
        if let Err(e) = store.insert_log(&entry).await {
            warn!(error = %e, "failed to persist log entry");
        }
        if entry.priority == Severity::Fatal {
            if let Some(fatal_tx) = fatal_tx.take() {
                error!(message = %entry.message, "fatal entry logged, shutting down");
                let _ = fatal_tx.send(entry.message);
            }
        }
    }
}
