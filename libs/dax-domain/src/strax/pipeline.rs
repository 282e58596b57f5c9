//! Shared fragment buffers and chunk output
//!
//! Readout threads call [`StraxPipeline::parse`] concurrently. Open chunks
//! live in a map guarded by a short-lived lock; each chunk has its own lock
//! for fragment appends. Flushing removes chunks from the map and seals
//! them, so a writer that raced with the flush sees the seal and retries on
//! a fresh buffer, which is then written as late data.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::compress::Compressor;
use super::fragment::Fragmenter;
use super::packet::{decode_events, DataPacket};
use super::{Result, StraxConfig, StraxError};
use crate::logging::{Severity, SharedLog};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Chunk a fragment belongs to, given the chunk of its packet
///
/// Fragments stay with their packet's chunk as long as they start inside
/// its window including the overlap.
pub fn route_fragment(packet_chunk: u64, time: u64, chunk_length: u64, chunk_overlap: u64) -> u64 {
    let window_end = (packet_chunk + 1)
        .saturating_mul(chunk_length)
        .saturating_add(chunk_overlap);
    if time < window_end {
        packet_chunk
    } else {
        time / chunk_length
    }
}

/// Counters exposed for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub bytes_parsed: u64,
    pub fragments: u64,
    pub buffered_bytes: u64,
    pub late_fragments: u64,
    pub failed_packets: u64,
    pub chunks_written: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_parsed: AtomicU64,
    fragments: AtomicU64,
    buffered_bytes: AtomicU64,
    late_fragments: AtomicU64,
    failed_packets: AtomicU64,
    chunks_written: AtomicU64,
}

#[derive(Debug, Default)]
struct ChunkBuffer {
    fragments: BTreeMap<i16, BytesMut>,
    bytes: u64,
    late: bool,
    sealed: bool,
}

#[derive(Debug, Default)]
struct OpenChunks {
    buffers: BTreeMap<u64, Arc<Mutex<ChunkBuffer>>>,
    /// Every chunk below this index has been flushed once
    flushed_below: u64,
}

#[derive(Debug, Default)]
struct Sources {
    latest: BTreeMap<i32, u64>,
    failures: BTreeMap<i32, u32>,
    disabled: BTreeSet<i32>,
}

#[derive(Debug, Default)]
struct Output {
    /// Placeholders exist for every chunk below this index
    missing_verified: u64,
    channels: BTreeSet<i16>,
    suffixes: HashMap<(u64, i16), u32>,
}

pub struct StraxPipeline {
    config: StraxConfig,
    fragmenter: Fragmenter,
    compressor: Box<dyn Compressor>,
    log: SharedLog,
    open: Mutex<OpenChunks>,
    sources: Mutex<Sources>,
    /// Also serializes flushes
    output: Mutex<Output>,
    counters: Counters,
    error: AtomicBool,
    closed: AtomicBool,
}

impl StraxPipeline {
    pub fn new(config: StraxConfig, compressor: Box<dyn Compressor>, log: SharedLog) -> Self {
        let channels = config
            .boards
            .iter()
            .flat_map(|(bid, model)| {
                (0..model.n_channels).filter_map(|ch| config.global_channel(*bid, ch))
            })
            .collect();

        info!(
            host = %config.host,
            output = %config.output_path.display(),
            chunk_length = config.chunk_length,
            chunk_overlap = config.chunk_overlap,
            compressor = compressor.name(),
            "strax pipeline ready"
        );

        Self {
            fragmenter: Fragmenter::new(config.fragment_length),
            config,
            compressor,
            log,
            open: Mutex::new(OpenChunks::default()),
            sources: Mutex::new(Sources::default()),
            output: Mutex::new(Output {
                channels,
                ..Output::default()
            }),
            counters: Counters::default(),
            error: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StraxConfig {
        &self.config
    }

    /// Decode a packet and buffer its fragments
    ///
    /// Malformed data fails only this packet: it is counted against the
    /// board and the board is disabled once the threshold is reached.
    pub fn parse(&self, packet: DataPacket) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StraxError::Closed);
        }
        let bid = packet.board();
        if self.is_board_disabled(bid) {
            return Err(StraxError::BoardDisabled(bid));
        }

        let routed = match self.fragment_packet(&packet) {
            Ok(routed) => routed,
            Err(e) => {
                self.counters.failed_packets.fetch_add(1, Ordering::Relaxed);
                warn!(board = bid, error = %e, "dropping packet");
                self.record_board_failure(bid);
                return Err(e);
            }
        };

        let packet_chunk = routed.packet_chunk;
        for (index, fragments) in routed.by_chunk {
            self.append(index, &fragments);
        }

        self.counters
            .bytes_parsed
            .fetch_add(packet.size_bytes() as u64, Ordering::Relaxed);

        let mut sources = lock(&self.sources);
        if !sources.disabled.contains(&bid) {
            let latest = sources.latest.entry(bid).or_insert(packet_chunk);
            *latest = (*latest).max(packet_chunk);
        }
        Ok(())
    }

    fn fragment_packet(&self, packet: &DataPacket) -> Result<Routed> {
        let bid = packet.board();
        let model = self
            .config
            .boards
            .get(&bid)
            .ok_or_else(|| StraxError::malformed(bid, "board not in this run"))?;

        let packet_ns = model
            .clock
            .to_ns(packet.clock_counter(), packet.header_time());
        let packet_chunk = packet_ns / self.config.chunk_length;

        let mut by_chunk: BTreeMap<u64, Vec<(i16, Bytes)>> = BTreeMap::new();
        for pulse in decode_events(packet, model)? {
            let channel = self.config.global_channel(bid, pulse.channel).ok_or_else(|| {
                StraxError::malformed(bid, format!("channel {} has no global id", pulse.channel))
            })?;
            for fragment in self
                .fragmenter
                .fragments(&pulse, channel, model.format.ns_per_sample)
            {
                let index = route_fragment(
                    packet_chunk,
                    fragment.time,
                    self.config.chunk_length,
                    self.config.chunk_overlap,
                );
                by_chunk
                    .entry(index)
                    .or_default()
                    .push((channel, fragment.bytes));
            }
        }
        Ok(Routed {
            packet_chunk,
            by_chunk,
        })
    }

    fn append(&self, index: u64, fragments: &[(i16, Bytes)]) {
        loop {
            let buffer = {
                let mut open = lock(&self.open);
                let late = index < open.flushed_below;
                Arc::clone(open.buffers.entry(index).or_insert_with(|| {
                    Arc::new(Mutex::new(ChunkBuffer {
                        late,
                        ..ChunkBuffer::default()
                    }))
                }))
            };

            let mut chunk = lock(&buffer);
            if chunk.sealed {
                // Flushed between lookup and lock
                continue;
            }
            let mut added = 0u64;
            for (channel, bytes) in fragments {
                chunk
                    .fragments
                    .entry(*channel)
                    .or_default()
                    .extend_from_slice(bytes);
                added += bytes.len() as u64;
            }
            chunk.bytes += added;
            let count = fragments.len() as u64;
            self.counters.fragments.fetch_add(count, Ordering::Relaxed);
            self.counters
                .buffered_bytes
                .fetch_add(added, Ordering::Relaxed);
            if chunk.late {
                self.counters
                    .late_fragments
                    .fetch_add(count, Ordering::Relaxed);
            }
            return;
        }
    }

    /// Count a failure against a board; returns whether the board is disabled
    pub fn record_board_failure(&self, bid: i32) -> bool {
        let threshold = self.config.board_fail_threshold.max(1);
        let mut sources = lock(&self.sources);
        let count = {
            let count = sources.failures.entry(bid).or_insert(0);
            *count += 1;
            *count
        };
        if count >= threshold && sources.disabled.insert(bid) {
            // A silent board must not hold back flushing
            sources.latest.remove(&bid);
            drop(sources);
            self.log.entry(
                &format!(
                    "Board {} disabled for this run after {} failures",
                    bid, count
                ),
                Severity::Error,
            );
            return true;
        }
        sources.disabled.contains(&bid)
    }

    pub fn is_board_disabled(&self, bid: i32) -> bool {
        lock(&self.sources).disabled.contains(&bid)
    }

    /// Flush every chunk no source can still deliver data for
    ///
    /// Skips when another thread is already flushing. Returns the number of
    /// chunks written.
    pub fn flush_ready(&self) -> Result<usize> {
        let Some(smallest) = lock(&self.sources).latest.values().min().copied() else {
            return Ok(0);
        };
        let ready = lock(&self.open)
            .buffers
            .keys()
            .next()
            .map_or(false, |first| *first < smallest);
        if !ready {
            return Ok(0);
        }
        let mut output = match self.output.try_lock() {
            Ok(output) => output,
            Err(TryLockError::WouldBlock) => return Ok(0),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        self.write_locked(&mut output, smallest - 1, false)
    }

    /// Write every open chunk up to `up_to`, or all of them when `is_final`
    pub fn write_out_files(&self, up_to: u64, is_final: bool) -> Result<usize> {
        let mut output = lock(&self.output);
        self.write_locked(&mut output, up_to, is_final)
    }

    fn write_locked(&self, output: &mut Output, up_to: u64, is_final: bool) -> Result<usize> {
        let taken: Vec<(u64, Arc<Mutex<ChunkBuffer>>)> = {
            let mut open = lock(&self.open);
            let keep = if is_final {
                BTreeMap::new()
            } else {
                open.buffers.split_off(&up_to.saturating_add(1))
            };
            let taken = mem::replace(&mut open.buffers, keep);
            let mark = if is_final {
                taken.keys().next_back().map(|last| last + 1)
            } else {
                Some(up_to.saturating_add(1))
            };
            if let Some(mark) = mark {
                open.flushed_below = open.flushed_below.max(mark);
            }
            taken.into_iter().collect()
        };

        let mut written = 0;
        let mut first_error = None;
        for (index, buffer) in taken {
            let (fragments, bytes, late) = {
                let mut chunk = lock(&buffer);
                chunk.sealed = true;
                (mem::take(&mut chunk.fragments), chunk.bytes, chunk.late)
            };
            self.counters
                .buffered_bytes
                .fetch_sub(bytes, Ordering::Relaxed);
            if fragments.is_empty() {
                continue;
            }
            match self.write_chunk(output, index, &fragments, late) {
                Ok(()) => written += 1,
                Err(e) => {
                    self.fail(&e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let verified_through = lock(&self.open).flushed_below.checked_sub(1);
        if let Some(through) = verified_through {
            if let Err(e) = self.create_missing(output, through) {
                self.fail(&e);
                first_error.get_or_insert(e);
            }
        }

        self.counters
            .chunks_written
            .fetch_add(written as u64, Ordering::Relaxed);
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    fn fail(&self, error: &StraxError) {
        self.error.store(true, Ordering::Release);
        self.log
            .entry(&format!("Failed to write chunk output: {}", error), Severity::Error);
    }

    pub fn chunk_name(&self, index: u64) -> String {
        format!("{:0width$}", index, width = self.config.chunk_name_length)
    }

    pub fn file_name(&self, channel: i16) -> String {
        format!("{}_{:05}", self.config.host, channel)
    }

    pub fn chunk_dir(&self, index: u64) -> PathBuf {
        self.config.output_path.join(self.chunk_name(index))
    }

    fn temp_dir(&self, index: u64) -> PathBuf {
        self.config
            .output_path
            .join(format!(".tmp_{}", self.config.host))
            .join(self.chunk_name(index))
    }

    fn write_chunk(
        &self,
        output: &mut Output,
        index: u64,
        fragments: &BTreeMap<i16, BytesMut>,
        late: bool,
    ) -> Result<()> {
        let temp = self.temp_dir(index);
        if temp.exists() {
            fs::remove_dir_all(&temp).map_err(|e| StraxError::io(&temp, e))?;
        }
        fs::create_dir_all(&temp).map_err(|e| StraxError::io(&temp, e))?;

        for (channel, data) in fragments {
            let path = temp.join(self.file_name(*channel));
            fs::write(&path, self.compressor.compress(data)).map_err(|e| StraxError::io(&path, e))?;
        }

        let target = self.chunk_dir(index);
        // Another node may create the chunk between the check and the rename
        let moved = !target.exists() && fs::rename(&temp, &target).is_ok();
        if !moved {
            fs::create_dir_all(&target).map_err(|e| StraxError::io(&target, e))?;
            for channel in fragments.keys() {
                let name = self.file_name(*channel);
                let mut destination = target.join(&name);
                if occupied(&destination) {
                    let suffix = output.suffixes.entry((index, *channel)).or_insert(0);
                    loop {
                        *suffix += 1;
                        destination = target.join(format!("{}_{}", name, suffix));
                        if !occupied(&destination) {
                            break;
                        }
                    }
                }
                let source = temp.join(&name);
                fs::rename(&source, &destination).map_err(|e| StraxError::io(&destination, e))?;
            }
            fs::remove_dir(&temp).map_err(|e| StraxError::io(&temp, e))?;
        }

        output.channels.extend(fragments.keys().copied());
        if late {
            let count: u64 = fragments
                .values()
                .map(|data| (data.len() / self.fragmenter.record_size()) as u64)
                .sum();
            self.log.entry(
                &format!(
                    "Wrote {} late fragments to already closed chunk {}",
                    count,
                    self.chunk_name(index)
                ),
                Severity::Warning,
            );
        }
        debug!(chunk = index, files = fragments.len(), late, "chunk written");
        Ok(())
    }

    /// Create empty files for every known channel in chunks up to `through`
    fn create_missing(&self, output: &mut Output, through: u64) -> Result<()> {
        if output.channels.is_empty() {
            return Ok(());
        }
        for index in output.missing_verified..=through {
            let dir = self.chunk_dir(index);
            fs::create_dir_all(&dir).map_err(|e| StraxError::io(&dir, e))?;
            for channel in &output.channels {
                let path = dir.join(self.file_name(*channel));
                if !path.exists() {
                    fs::File::create(&path).map_err(|e| StraxError::io(&path, e))?;
                }
            }
        }
        output.missing_verified = output.missing_verified.max(through + 1);
        Ok(())
    }

    /// Flush everything, write the end marker and report per-board failures
    ///
    /// Only the first call writes; later calls return the same counts.
    pub fn close(&self) -> BTreeMap<i32, u32> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut output = lock(&self.output);
            if let Ok(written) = self.write_locked(&mut output, u64::MAX, true) {
                debug!(written, "final flush done");
            }
            let marker_dir = self.config.output_path.join("THE_END");
            let marker = marker_dir.join(&self.config.host);
            let result = fs::create_dir_all(&marker_dir)
                .and_then(|_| fs::write(&marker, b""))
                .map_err(|e| StraxError::io(&marker, e));
            if let Err(e) = result {
                self.fail(&e);
            }
            info!(stats = ?self.stats(), "strax pipeline closed");
        }
        lock(&self.sources).failures.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sticky I/O error flag
    pub fn check_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.counters.buffered_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            bytes_parsed: c.bytes_parsed.load(Ordering::Relaxed),
            fragments: c.fragments.load(Ordering::Relaxed),
            buffered_bytes: c.buffered_bytes.load(Ordering::Relaxed),
            late_fragments: c.late_fragments.load(Ordering::Relaxed),
            failed_packets: c.failed_packets.load(Ordering::Relaxed),
            chunks_written: c.chunks_written.load(Ordering::Relaxed),
        }
    }
}

struct Routed {
    packet_chunk: u64,
    by_chunk: BTreeMap<u64, Vec<(i16, Bytes)>>,
}

/// A file with content; empty files are placeholders
fn occupied(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::encode_event;
    use crate::hardware::BoardModel;
    use crate::logging::{MockLogSink, TracingSink};
    use crate::strax::compress::{Lz4Compressor, Passthrough};
    use crate::strax::fragment::read_fragments;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    const L: u64 = 100_000_000;
    const OVERLAP: u64 = 1_000_000;

    fn config(output: &Path) -> StraxConfig {
        StraxConfig {
            host: "reader0".to_string(),
            output_path: output.to_path_buf(),
            chunk_length: L,
            chunk_overlap: OVERLAP,
            fragment_length: 220,
            chunk_name_length: 6,
            board_fail_threshold: 2,
            boards: [(1, &BoardModel::V1724), (2, &BoardModel::V1724)]
                .into_iter()
                .collect(),
            channels: BTreeMap::new(),
        }
    }

    fn pipeline(output: &Path) -> StraxPipeline {
        StraxPipeline::new(
            config(output),
            Box::new(Passthrough),
            TracingSink::shared("reader0"),
        )
    }

    /// Packet with one event on channel 0 at `ns`
    fn packet_at(board: i32, ns: u64) -> DataPacket {
        let ticks = ns / 10;
        let counter = ticks >> 31;
        let raw = (ticks & 0x7FFF_FFFF) as u32;
        DataPacket::new(board, encode_event(&BoardModel::V1724, 0b1, raw, &[100; 8]), counter, raw)
    }

    fn times_in(path: &Path) -> Vec<i64> {
        let data = fs::read(path).unwrap();
        read_fragments(&data, 220)
            .into_iter()
            .map(|(header, _)| header.time)
            .collect()
    }

    #[test]
    fn test_route_fragment_overlap_window() {
        assert_eq!(route_fragment(0, 99_999_999, L, OVERLAP), 0);
        assert_eq!(route_fragment(0, 100_500_000, L, OVERLAP), 0);
        assert_eq!(route_fragment(0, 101_000_000, L, OVERLAP), 1);
        assert_eq!(route_fragment(0, 250_000_000, L, OVERLAP), 2);
        assert_eq!(route_fragment(3, 10, L, OVERLAP), 3);
    }

    #[test]
    fn test_packets_land_in_their_chunks() {
        let dir = TempDir::new().unwrap();
        let strax = pipeline(dir.path());

        strax.parse(packet_at(1, 100)).unwrap();
        strax.parse(packet_at(1, 100_000_100)).unwrap();
        strax.parse(packet_at(2, 99_500_000)).unwrap();
        strax.close();

        // Board 1 channel 0 is global channel 8, board 2 channel 0 is 16
        let chunk0 = dir.path().join("000000");
        let chunk1 = dir.path().join("000001");
        assert_eq!(times_in(&chunk0.join("reader0_00008")), vec![100]);
        assert_eq!(times_in(&chunk1.join("reader0_00008")), vec![100_000_100]);
        assert_eq!(times_in(&chunk0.join("reader0_00016")), vec![99_500_000]);
        // Nothing from board 2 in chunk 1, so only a placeholder
        assert_eq!(fs::metadata(chunk1.join("reader0_00016")).unwrap().len(), 0);
        assert!(dir.path().join("THE_END").join("reader0").exists());
        assert!(!dir.path().join(".tmp_reader0").join("000000").exists());
    }

    #[test]
    fn test_flush_waits_for_slowest_source() {
        let dir = TempDir::new().unwrap();
        let strax = pipeline(dir.path());

        strax.parse(packet_at(1, 10)).unwrap();
        strax.parse(packet_at(2, 20)).unwrap();
        strax.parse(packet_at(1, 150_000_000)).unwrap();
        strax.parse(packet_at(1, 250_000_000)).unwrap();
        assert_eq!(strax.flush_ready().unwrap(), 0);
        assert!(!dir.path().join("000000").exists());

        strax.parse(packet_at(2, 260_000_000)).unwrap();
        assert_eq!(strax.flush_ready().unwrap(), 2);
        assert!(dir.path().join("000000").join("reader0_00016").exists());
        assert!(dir.path().join("000001").join("reader0_00008").exists());
        assert!(!dir.path().join("000002").exists());
        assert!(strax.buffered_bytes() > 0);
    }

    #[test]
    fn test_late_fragments_go_to_suffix_file() {
        let dir = TempDir::new().unwrap();
        let strax = pipeline(dir.path());

        strax.parse(packet_at(1, 10)).unwrap();
        strax.parse(packet_at(2, 20)).unwrap();
        strax.parse(packet_at(1, 150_000_000)).unwrap();
        strax.parse(packet_at(2, 160_000_000)).unwrap();
        assert_eq!(strax.flush_ready().unwrap(), 1);

        strax.parse(packet_at(2, 30)).unwrap();
        assert_eq!(strax.stats().late_fragments, 1);
        strax.close();

        let chunk0 = dir.path().join("000000");
        assert_eq!(times_in(&chunk0.join("reader0_00016")), vec![20]);
        assert_eq!(times_in(&chunk0.join("reader0_00016_1")), vec![30]);
    }

    #[test]
    fn test_skipped_chunks_get_placeholders() {
        let dir = TempDir::new().unwrap();
        let strax = pipeline(dir.path());

        strax.parse(packet_at(1, 10)).unwrap();
        strax.parse(packet_at(1, 350_000_000)).unwrap();
        strax.close();

        for chunk in ["000000", "000001", "000002", "000003"] {
            let chunk_dir = dir.path().join(chunk);
            for channel in [8, 15, 16, 23] {
                assert!(
                    chunk_dir.join(format!("reader0_{:05}", channel)).exists(),
                    "missing {} channel {}",
                    chunk,
                    channel
                );
            }
        }
        assert!(!dir.path().join("000004").exists());
    }

    #[test]
    fn test_malformed_packets_disable_board_at_threshold() {
        let dir = TempDir::new().unwrap();
        let mut log = MockLogSink::new();
        log.expect_entry()
            .withf(|msg, severity| *severity == Severity::Error && msg.contains("Board 1"))
            .times(1)
            .return_const(());
        log.expect_entry()
            .withf(|_, severity| *severity != Severity::Error)
            .returning(|_, _| ());
        let strax = StraxPipeline::new(config(dir.path()), Box::new(Passthrough), Arc::new(log));

        let broken = DataPacket::new(1, vec![0xA000_0010, 0, 0, 5], 0, 5);
        assert!(strax.parse(broken.clone()).is_err());
        assert!(!strax.is_board_disabled(1));
        assert!(strax.parse(broken).is_err());
        assert!(strax.is_board_disabled(1));
        assert!(matches!(
            strax.parse(packet_at(1, 10)),
            Err(StraxError::BoardDisabled(1))
        ));

        // Other boards keep going
        strax.parse(packet_at(2, 10)).unwrap();
        assert_eq!(strax.stats().failed_packets, 2);
        assert_eq!(strax.close().get(&1), Some(&2));
    }

    #[test]
    fn test_unknown_board_is_a_failure_not_a_panic() {
        let dir = TempDir::new().unwrap();
        let strax = pipeline(dir.path());

        assert!(matches!(
            strax.parse(packet_at(9, 10)),
            Err(StraxError::Malformed { board: 9, .. })
        ));
        assert_eq!(strax.close().get(&9), Some(&1));
    }

    #[test]
    fn test_io_failure_sets_sticky_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let strax = pipeline(file.path());

        strax.parse(packet_at(1, 10)).unwrap();
        assert!(!strax.check_error());
        assert!(strax.write_out_files(0, false).is_err());
        assert!(strax.check_error());
    }

    #[test]
    fn test_lz4_output_reads_back() {
        let dir = TempDir::new().unwrap();
        let strax = StraxPipeline::new(
            config(dir.path()),
            Box::new(Lz4Compressor),
            TracingSink::shared("reader0"),
        );

        strax.parse(packet_at(1, 500)).unwrap();
        strax.close();

        let packed = fs::read(dir.path().join("000000").join("reader0_00008")).unwrap();
        let data = Lz4Compressor.decompress(&packed).unwrap();
        let records = read_fragments(&data, 220);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0.time, 500);
        assert_eq!(records[0].0.length, 8);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let strax = pipeline(dir.path());
        strax.parse(packet_at(1, 10)).unwrap();

        let first = strax.close();
        let second = strax.close();
        assert_eq!(first, second);
        assert!(matches!(
            strax.parse(packet_at(1, 20)),
            Err(StraxError::Closed)
        ));
        assert_eq!(strax.stats().chunks_written, 1);
    }

    #[test]
    fn test_concurrent_parse_keeps_every_fragment() {
        let dir = TempDir::new().unwrap();
        let strax = Arc::new(pipeline(dir.path()));

        let handles: Vec<_> = [1, 2]
            .into_iter()
            .map(|board| {
                let strax = Arc::clone(&strax);
                thread::spawn(move || {
                    for i in 0..200u64 {
                        strax.parse(packet_at(board, i * 2_000_000)).unwrap();
                        let _ = strax.flush_ready();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        strax.close();

        let mut total = 0;
        for entry in fs::read_dir(dir.path()).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if !name.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            for file in fs::read_dir(&path).unwrap() {
                total += times_in(&file.unwrap().path()).len();
            }
        }
        assert_eq!(total, 400);
        assert!(!strax.check_error());
    }
}
