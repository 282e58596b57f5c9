//! dax - Readout Node
//!
//! Drives the digitizers of this host from commands posted to the shared
//! document store and writes their data as strax chunks.

mod config;
mod log_sink;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dax_domain::hardware::sim::SimulatedBus;
use dax_domain::hardware::BoardModel;
use dax_domain::{CommandProcessor, DaqController, LogSink, Severity, SharedLog};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{node_identity, BusKind, LogFormat, NodeConfig};
use crate::log_sink::StoreLogSink;

const FORWARDER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "dax", version, about = "DAX digitizer readout node")]
struct Args {
    /// Shared store URI (`memory://` or `file:///path/to/store`)
    uri: String,

    /// Appended to the hostname when several readout nodes share one host
    node_index: Option<u32>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = NodeConfig::from_env()?;
    init_tracing(config.log_format);

    let hostname = hostname::get()
        .context("cannot read hostname")?
        .to_string_lossy()
        .into_owned();
    let host = node_identity(&hostname, args.node_index);
    info!(host = %host, uri = %args.uri, "Starting dax readout node");

    let store = dax_store::connect(&args.uri)
        .await
        .with_context(|| format!("cannot open store {}", args.uri))?;

    let (sink, forwarder, fatal) = StoreLogSink::spawn(store.clone(), &host);
    let log: SharedLog = sink;

    let bus = match config.bus {
        BusKind::Simulated => {
            warn!("using the simulated bus, every configured board is emulated");
            SimulatedBus::permissive(&BoardModel::V1724)
        }
    };

    let controller = DaqController::new(bus, host.clone(), Arc::clone(&log));
    let mut processor = CommandProcessor::new(store, controller, Arc::clone(&log));
    log.entry("Readout node started", Severity::Message);

    let mut fatal_reason = None;
    processor
        .run(config.poll_interval, async {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "cannot listen for ctrl-c, stopping");
                    }
                    info!("Received shutdown signal");
                }
                message = fatal => fatal_reason = message.ok(),
            }
        })
        .await;

    // Let the forwarder persist what is queued
    drop(processor);
    drop(log);
    if tokio::time::timeout(FORWARDER_DRAIN, forwarder).await.is_err() {
        warn!("log forwarder did not drain in time");
    }

    match fatal_reason {
        Some(message) => Err(anyhow!("fatal error: {}", message)),
        None => {
            info!(host = %host, "Readout node stopped");
            Ok(())
        }
    }
}
