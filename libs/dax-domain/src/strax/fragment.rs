//! Strax fragment format
//!
//! A fragment is a 24-byte little-endian header followed by a fixed-size,
//! zero-padded payload of 16-bit samples. A pulse longer than one payload is
//! cut into consecutive fragments sharing `pulse_length` and numbered by
//! `record_i`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::ChannelPulse;

pub const FRAGMENT_HEADER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Start time of this fragment in ns
    pub time: i64,
    /// Samples carried by this fragment
    pub length: i32,
    /// ns per sample
    pub dt: i16,
    pub channel: i16,
    /// Samples in the whole pulse
    pub pulse_length: i32,
    /// Index of this fragment within its pulse
    pub record_i: i16,
    pub baseline: i16,
}

impl FragmentHeader {
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.time);
        buf.put_i32_le(self.length);
        buf.put_i16_le(self.dt);
        buf.put_i16_le(self.channel);
        buf.put_i32_le(self.pulse_length);
        buf.put_i16_le(self.record_i);
        buf.put_i16_le(self.baseline);
    }

    /// Read a header from the front of `buf`, `None` if it is too short
    pub fn read_from(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            time: buf.get_i64_le(),
            length: buf.get_i32_le(),
            dt: buf.get_i16_le(),
            channel: buf.get_i16_le(),
            pulse_length: buf.get_i32_le(),
            record_i: buf.get_i16_le(),
            baseline: buf.get_i16_le(),
        })
    }
}

/// One encoded fragment and its start time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub time: u64,
    pub bytes: Bytes,
}

/// Cuts channel pulses into fragments of a fixed payload size
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    fragment_length: usize,
}

impl Fragmenter {
    /// `fragment_length` is the payload size in bytes and must be even
    pub fn new(fragment_length: usize) -> Self {
        Self {
            fragment_length: fragment_length.max(2),
        }
    }

    pub fn samples_per_fragment(&self) -> usize {
        self.fragment_length / 2
    }

    pub fn record_size(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.fragment_length
    }

    pub fn fragments(&self, pulse: &ChannelPulse<'_>, channel: i16, dt: u16) -> Vec<Fragment> {
        let per_fragment = self.samples_per_fragment();
        let samples: Vec<u16> = pulse.samples().collect();
        let pulse_length = samples.len() as i32;

        samples
            .chunks(per_fragment)
            .enumerate()
            .map(|(record_i, chunk)| {
                let time = pulse.time_ns + (record_i * per_fragment) as u64 * u64::from(dt);
                let header = FragmentHeader {
                    time: time as i64,
                    length: chunk.len() as i32,
                    dt: dt as i16,
                    channel,
                    pulse_length,
                    record_i: record_i as i16,
                    baseline: 0,
                };
                let mut buf = BytesMut::with_capacity(self.record_size());
                header.write_to(&mut buf);
                for sample in chunk {
                    buf.put_u16_le(*sample);
                }
                buf.put_bytes(0, (per_fragment - chunk.len()) * 2);
                Fragment {
                    time,
                    bytes: buf.freeze(),
                }
            })
            .collect()
    }
}

/// Split a decompressed strax file into headers and payloads
///
/// Trailing bytes that do not form a whole record are ignored.
pub fn read_fragments(data: &[u8], fragment_length: usize) -> Vec<(FragmentHeader, &[u8])> {
    data.chunks_exact(FRAGMENT_HEADER_SIZE + fragment_length)
        .filter_map(|record| {
            FragmentHeader::read_from(record)
                .map(|header| (header, &record[FRAGMENT_HEADER_SIZE..]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(words: &[u32], time_ns: u64) -> ChannelPulse<'_> {
        ChannelPulse {
            channel: 1,
            time_ns,
            words,
        }
    }

    #[test]
    fn test_header_is_24_bytes_little_endian() {
        let header = FragmentHeader {
            time: 0x0102,
            length: 3,
            dt: 10,
            channel: 7,
            pulse_length: 3,
            record_i: 0,
            baseline: 0,
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);

        assert_eq!(buf.len(), FRAGMENT_HEADER_SIZE);
        assert_eq!(&buf[..2], &[0x02, 0x01]);
        assert_eq!(&buf[14..16], &[7, 0]);
        assert_eq!(FragmentHeader::read_from(&buf), Some(header));
    }

    #[test]
    fn test_long_pulse_is_split_and_padded() {
        // 6 samples, 4 per fragment
        let words = [0x0002_0001, 0x0004_0003, 0x0006_0005];
        let fragments = Fragmenter::new(8).fragments(&pulse(&words, 1000), 42, 10);

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].time, 1000);
        assert_eq!(fragments[1].time, 1040);

        let mut data = BytesMut::new();
        for fragment in &fragments {
            assert_eq!(fragment.bytes.len(), 32);
            data.extend_from_slice(&fragment.bytes);
        }
        let records = read_fragments(&data, 8);
        assert_eq!(records.len(), 2);

        let (second, payload) = records[1];
        assert_eq!(second.length, 2);
        assert_eq!(second.pulse_length, 6);
        assert_eq!(second.record_i, 1);
        assert_eq!(second.channel, 42);
        assert_eq!(payload, &[5, 0, 6, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_pulse_has_no_fragments() {
        assert!(Fragmenter::new(220).fragments(&pulse(&[], 0), 0, 10).is_empty());
    }
}
