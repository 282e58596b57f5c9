//! Extended clock reconstruction
//!
//! Digitizers stamp every event with a fixed-width trigger time tag that
//! wraps around every few seconds (2^31 ticks of 10 ns on a V1724, about
//! 21.5 s). A [`ClockDomain`] follows the raw values a board reports and
//! counts the wraparounds so that `counter << bits | raw` keeps growing for
//! the whole run.
//!
//! A wrap is only accepted after the raw time has been seen above the high
//! threshold and then drops below the low threshold. Anything else that goes
//! backwards is jitter and must not bump the counter.

use std::time::{Duration, Instant};

/// Width, tick and wrap thresholds of a board's hardware time counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSpec {
    /// Number of significant bits in the raw counter
    pub counter_bits: u32,
    /// Nanoseconds per counter tick
    pub tick_ns: u64,
    /// Raw values below this are "near the low end"
    pub low_threshold: u32,
    /// Raw values at or above this are "near the high end"
    pub high_threshold: u32,
}

impl ClockSpec {
    /// 31-bit trigger time tag counting 10 ns ticks
    pub const V1724: ClockSpec = ClockSpec {
        counter_bits: 31,
        tick_ns: 10,
        low_threshold: 500_000_000,
        high_threshold: 1_500_000_000,
    };

    /// 31-bit trigger time tag counting 8 ns ticks
    pub const V1730: ClockSpec = ClockSpec {
        counter_bits: 31,
        tick_ns: 8,
        low_threshold: 500_000_000,
        high_threshold: 1_500_000_000,
    };

    /// Number of ticks in one full counter period
    pub fn period_ticks(&self) -> u64 {
        1u64 << self.counter_bits
    }

    /// Mask selecting the significant bits of a raw value
    pub fn mask(&self) -> u32 {
        (self.period_ticks() - 1) as u32
    }

    /// Wall-clock duration of one counter period
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ticks() * self.tick_ns)
    }

    /// Combine a wrap counter and a raw value into extended ticks
    pub fn extended_ticks(&self, counter: u64, raw: u32) -> u64 {
        (counter << self.counter_bits) + u64::from(raw & self.mask())
    }

    /// Combine a wrap counter and a raw value into nanoseconds
    pub fn to_ns(&self, counter: u64, raw: u32) -> u64 {
        self.extended_ticks(counter, raw) * self.tick_ns
    }

    /// Wrap counter for `raw`, given that `reference` was read with `counter`
    ///
    /// Used inside one buffer, where an event (or a channel) can sit on the
    /// other side of a wrap from the time the buffer was stamped with.
    pub fn relative_counter(&self, reference: u32, counter: u64, raw: u32) -> u64 {
        let reference = reference & self.mask();
        let raw = raw & self.mask();
        if raw < self.low_threshold && reference >= self.high_threshold {
            counter + 1
        } else if raw >= self.high_threshold && reference < self.low_threshold && counter > 0 {
            counter - 1
        } else {
            counter
        }
    }
}

/// Something odd seen while extending a raw time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAnomaly {
    /// Raw time went backwards without passing through the wrap thresholds
    Jitter { raw: u32, last: u32 },
    /// A high raw time arrived after the counter already wrapped
    Straggler { raw: u32 },
    /// More than one counter period elapsed between two reads; wraps in
    /// between cannot be counted
    SkippedPeriod { elapsed: Duration },
}

/// Result of feeding one raw time to a [`ClockDomain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    /// Wrap counter the raw time belongs to
    ///
    /// One less than [`ClockDomain::counter`] for a straggler from before the
    /// last wrap, so `spec.to_ns(counter, raw)` is the true time of the read.
    pub counter: u64,
    /// Extended time in ticks, never below the previous reading
    pub ticks: u64,
    /// Set when the read did not follow the expected pattern
    pub anomaly: Option<ClockAnomaly>,
}

/// Per-board wraparound tracker
#[derive(Debug, Clone)]
pub struct ClockDomain {
    spec: ClockSpec,
    counter: u64,
    last_time: u32,
    seen_low: bool,
    seen_high: bool,
    last_ticks: Option<u64>,
    last_read: Option<Instant>,
    anomalies: u64,
}

impl ClockDomain {
    pub fn new(spec: ClockSpec) -> Self {
        Self {
            spec,
            counter: 0,
            last_time: 0,
            seen_low: false,
            seen_high: false,
            last_ticks: None,
            last_read: None,
            anomalies: 0,
        }
    }

    pub fn spec(&self) -> &ClockSpec {
        &self.spec
    }

    /// Number of wraparounds counted so far
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Number of reads that produced an anomaly
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Feed one raw hardware time read at `now`
    pub fn extend(&mut self, raw: u32, now: Instant) -> ClockReading {
        let raw = raw & self.spec.mask();
        let low = self.spec.low_threshold;
        let high = self.spec.high_threshold;
        let mut anomaly = None;
        let mut counter = self.counter;

        if let Some(previous) = self.last_read {
            let elapsed = now.saturating_duration_since(previous);
            if elapsed > self.spec.period() {
                anomaly = Some(ClockAnomaly::SkippedPeriod { elapsed });
            }
        }
        self.last_read = Some(now);

        if raw > self.last_time {
            if raw >= high && self.seen_low && self.counter > 0 {
                // Belongs to the period before the last wrap
                counter = self.counter - 1;
                anomaly.get_or_insert(ClockAnomaly::Straggler { raw });
            } else if raw >= low && raw < high && self.seen_low {
                self.seen_low = false;
                self.last_time = raw;
            } else if raw >= high && !self.seen_low {
                self.seen_high = true;
                self.last_time = raw;
            } else {
                self.last_time = raw;
            }
        } else if raw < self.last_time {
            if raw < low && !self.seen_low && self.seen_high {
                self.seen_low = true;
                self.seen_high = false;
                self.last_time = raw;
                self.counter += 1;
                counter = self.counter;
            } else {
                anomaly.get_or_insert(ClockAnomaly::Jitter {
                    raw,
                    last: self.last_time,
                });
            }
        }

        let mut ticks = self.spec.extended_ticks(counter, raw);
        if let Some(previous) = self.last_ticks {
            ticks = ticks.max(previous);
        }
        self.last_ticks = Some(ticks);

        if anomaly.is_some() {
            self.anomalies += 1;
        }

        ClockReading {
            counter,
            ticks,
            anomaly,
        }
    }
}
