//! Readout workers
//!
//! One OS thread per optical link. A worker owns the digitizers on its link
//! for the duration of the run and hands every packet to the shared
//! pipeline. The stop flag is checked once per pass over the boards; after
//! it drops every board is drained once more.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::hardware::{BoardLink, Digitizer};
use crate::strax::{StraxError, StraxPipeline};

/// Counters shared between the workers and the controller
#[derive(Debug, Default)]
pub struct RunCounters {
    bytes_read: AtomicU64,
    packets: AtomicU64,
}

impl RunCounters {
    pub fn add_packet(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes read since the previous call
    pub fn take_bytes(&self) -> u64 {
        self.bytes_read.swap(0, Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

/// Handle on a running readout thread
pub struct ReadoutWorker<L: BoardLink + 'static> {
    link: i32,
    boards: Vec<i32>,
    handle: JoinHandle<Vec<Digitizer<L>>>,
}

impl<L: BoardLink + 'static> ReadoutWorker<L> {
    /// Start reading `digitizers` until `running` drops
    pub fn spawn(
        link: i32,
        digitizers: Vec<Digitizer<L>>,
        pipeline: Arc<StraxPipeline>,
        running: Arc<AtomicBool>,
        counters: Arc<RunCounters>,
        idle_sleep: Duration,
    ) -> io::Result<Self> {
        let boards = digitizers.iter().map(Digitizer::bid).collect();
        let handle = thread::Builder::new()
            .name(format!("readout-link-{}", link))
            .spawn(move || read_loop(link, digitizers, &pipeline, &running, &counters, idle_sleep))?;
        Ok(Self {
            link,
            boards,
            handle,
        })
    }

    pub fn link(&self) -> i32 {
        self.link
    }

    pub fn boards(&self) -> &[i32] {
        &self.boards
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread and take the digitizers back
    ///
    /// `None` if the thread panicked; its boards are lost for this session.
    pub fn join(self) -> Option<Vec<Digitizer<L>>> {
        self.handle.join().ok()
    }
}

fn read_loop<L: BoardLink>(
    link: i32,
    mut digitizers: Vec<Digitizer<L>>,
    pipeline: &StraxPipeline,
    running: &AtomicBool,
    counters: &RunCounters,
    idle_sleep: Duration,
) -> Vec<Digitizer<L>> {
    info!(link, boards = digitizers.len(), "readout thread started");

    while running.load(Ordering::Acquire) {
        if read_pass(&mut digitizers, pipeline, counters) == 0 {
            thread::sleep(idle_sleep);
        } else if let Err(e) = pipeline.flush_ready() {
            debug!(link, error = %e, "flush from readout thread failed");
        }
    }

    let drained = read_pass(&mut digitizers, pipeline, counters);
    info!(link, drained, "readout thread finished");
    digitizers
}

/// Read every enabled board once; returns the bytes read
fn read_pass<L: BoardLink>(
    digitizers: &mut [Digitizer<L>],
    pipeline: &StraxPipeline,
    counters: &RunCounters,
) -> u64 {
    let mut total = 0;
    for digitizer in digitizers.iter_mut() {
        let bid = digitizer.bid();
        if pipeline.is_board_disabled(bid) {
            continue;
        }
        match digitizer.read_bulk() {
            Ok(Some(packet)) => {
                let bytes = packet.size_bytes() as u64;
                total += bytes;
                counters.add_packet(bytes);
                match pipeline.parse(packet) {
                    Ok(()) => trace!(board = bid, bytes, "packet parsed"),
                    Err(StraxError::BoardDisabled(_)) | Err(StraxError::Closed) => {}
                    Err(e) => debug!(board = bid, error = %e, "packet rejected"),
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(board = bid, error = %e, "readout failed");
                pipeline.record_board_failure(bid);
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimBoardConfig, SimulatedBus, SimulatedLink};
    use crate::hardware::{BoardModel, BusAddress};
    use crate::logging::TracingSink;
    use crate::strax::{Passthrough, StraxConfig};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::TempDir;

    fn board(bus: &SimulatedBus, bid: i32, config: SimBoardConfig) -> Digitizer<SimulatedLink> {
        let address = BusAddress::new(0, 0, bid as u32 * 0x1000);
        bus.add_board(address, config);
        let mut digi = Digitizer::init(
            bus,
            &BoardModel::V1724,
            address,
            bid,
            TracingSink::shared("test"),
        )
        .unwrap();
        digi.software_start().unwrap();
        digi
    }

    fn pipeline(output: &Path, threshold: u32) -> Arc<StraxPipeline> {
        let config = StraxConfig {
            host: "reader0".to_string(),
            output_path: output.to_path_buf(),
            chunk_length: 100_000_000,
            chunk_overlap: 1_000_000,
            fragment_length: 220,
            chunk_name_length: 6,
            board_fail_threshold: threshold,
            boards: [(1, &BoardModel::V1724), (2, &BoardModel::V1724)]
                .into_iter()
                .collect(),
            channels: BTreeMap::new(),
        };
        Arc::new(StraxPipeline::new(
            config,
            Box::new(Passthrough),
            TracingSink::shared("reader0"),
        ))
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_worker_reads_until_stopped_and_returns_boards() {
        let dir = TempDir::new().unwrap();
        let bus = SimulatedBus::new();
        let digis = vec![
            board(&bus, 1, SimBoardConfig::new(&BoardModel::V1724)),
            board(&bus, 2, SimBoardConfig::new(&BoardModel::V1724)),
        ];
        let strax = pipeline(dir.path(), 20);
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(RunCounters::default());

        let worker = ReadoutWorker::spawn(
            0,
            digis,
            Arc::clone(&strax),
            Arc::clone(&running),
            Arc::clone(&counters),
            Duration::from_micros(100),
        )
        .unwrap();
        assert_eq!(worker.boards(), &[1, 2]);

        wait_until(|| counters.packets() >= 10);
        running.store(false, Ordering::Release);
        wait_until(|| worker.is_finished());
        let boards = worker.join().unwrap();

        assert_eq!(boards.len(), 2);
        assert!(counters.packets() >= 10);
        assert!(counters.take_bytes() > 0);
        assert_eq!(counters.take_bytes(), 0);
        assert!(strax.stats().fragments > 0);
    }

    #[test]
    fn test_failing_board_is_disabled_and_others_continue() {
        let dir = TempDir::new().unwrap();
        let bus = SimulatedBus::new();
        let digis = vec![
            board(
                &bus,
                1,
                SimBoardConfig::new(&BoardModel::V1724).failing_reads(),
            ),
            board(&bus, 2, SimBoardConfig::new(&BoardModel::V1724)),
        ];
        let strax = pipeline(dir.path(), 3);
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(RunCounters::default());

        let worker = ReadoutWorker::spawn(
            0,
            digis,
            Arc::clone(&strax),
            Arc::clone(&running),
            counters,
            Duration::from_micros(100),
        )
        .unwrap();

        wait_until(|| strax.is_board_disabled(1));
        running.store(false, Ordering::Release);
        let boards = worker.join().unwrap();

        assert!(strax.is_board_disabled(1));
        assert!(!strax.is_board_disabled(2));
        assert!(boards[0].has_error());
        assert_eq!(strax.close().get(&1), Some(&3));
    }

    #[test]
    fn test_malformed_events_disable_the_board_and_others_continue() {
        let dir = TempDir::new().unwrap();
        let bus = SimulatedBus::new();
        let digis = vec![
            board(&bus, 1, SimBoardConfig::new(&BoardModel::V1724).corrupt()),
            board(&bus, 2, SimBoardConfig::new(&BoardModel::V1724)),
        ];
        let strax = pipeline(dir.path(), 3);
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(RunCounters::default());

        let worker = ReadoutWorker::spawn(
            0,
            digis,
            Arc::clone(&strax),
            Arc::clone(&running),
            counters,
            Duration::from_micros(100),
        )
        .unwrap();

        wait_until(|| strax.is_board_disabled(1) && strax.stats().fragments > 0);
        running.store(false, Ordering::Release);
        let boards = worker.join().unwrap();

        assert!(strax.is_board_disabled(1));
        assert!(!strax.is_board_disabled(2));
        assert_eq!(strax.stats().failed_packets, 3);
        // Bad data is the pipeline's business, the bus itself was fine
        assert!(!boards[0].has_error());
        assert_eq!(strax.close().get(&1), Some(&3));
    }

    #[test]
    fn test_packets_across_a_clock_wrap_stay_in_order() {
        let dir = TempDir::new().unwrap();
        let bus = SimulatedBus::new();
        let clock = BoardModel::V1724.clock;
        // 3 ms of raw clock left before the wrap, 40 ms per read
        let start = (clock.period_ticks() - 300_000) as u32;
        let mut digi = board(
            &bus,
            1,
            SimBoardConfig::new(&BoardModel::V1724).with_start_time(start),
        );
        let strax = pipeline(dir.path(), 20);

        let mut previous = 0;
        for _ in 0..40 {
            let packet = digi.read_bulk().unwrap().expect("running board has events");
            let packet_ns = clock.to_ns(packet.clock_counter(), packet.header_time());
            assert!(packet_ns >= previous, "{} after {}", packet_ns, previous);
            previous = packet_ns;
            strax.parse(packet).unwrap();
            strax.flush_ready().unwrap();
        }

        assert_eq!(digi.clock_counter(), 1);
        assert!(previous > clock.to_ns(1, 0));
        let stats = strax.stats();
        assert_eq!(stats.late_fragments, 0);
        assert_eq!(stats.failed_packets, 0);
        assert!(stats.chunks_written > 0);
    }
}
