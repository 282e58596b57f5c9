//! Data packets and event decoding

use crate::hardware::models::{BOARD_FAIL_BIT, EVENT_HEADER_MARKER};
use crate::hardware::BoardModel;

use super::{Result, StraxError};

/// One bulk read from one board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    board: i32,
    words: Vec<u32>,
    clock_counter: u64,
    header_time: u32,
}

impl DataPacket {
    pub fn new(board: i32, words: Vec<u32>, clock_counter: u64, header_time: u32) -> Self {
        Self {
            board,
            words,
            clock_counter,
            header_time,
        }
    }

    pub fn board(&self) -> i32 {
        self.board
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn size_bytes(&self) -> usize {
        self.words.len() * std::mem::size_of::<u32>()
    }

    /// Wrap counter of the board clock when the packet was read
    pub fn clock_counter(&self) -> u64 {
        self.clock_counter
    }

    /// Raw trigger time of the first event in the packet
    pub fn header_time(&self) -> u32 {
        self.header_time
    }
}

fn is_event_header(word: u32) -> bool {
    word >> 28 == EVENT_HEADER_MARKER
}

/// Trigger time of the first event header in a readout buffer
pub fn first_header_time(words: &[u32], clock_mask: u32) -> Option<u32> {
    let start = words.iter().position(|word| is_event_header(*word))?;
    words.get(start + 3).map(|time| time & clock_mask)
}

/// One channel's samples within one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPulse<'a> {
    pub channel: u32,
    /// Start time in ns on the extended clock
    pub time_ns: u64,
    /// Sample words, two 16-bit samples each, low half first
    pub words: &'a [u32],
}

impl ChannelPulse<'_> {
    pub fn n_samples(&self) -> usize {
        self.words.len() * 2
    }

    pub fn samples(&self) -> impl Iterator<Item = u16> + '_ {
        self.words
            .iter()
            .flat_map(|word| [(word & 0xFFFF) as u16, (word >> 16) as u16])
    }
}

/// Split a packet into channel pulses
///
/// Words before the first event header are skipped. Any event that does
/// not fit in the buffer, or whose channel blocks do not fit in the event,
/// fails the whole packet.
pub fn decode_events<'a>(packet: &'a DataPacket, model: &BoardModel) -> Result<Vec<ChannelPulse<'a>>> {
    let bid = packet.board;
    let words = packet.words.as_slice();
    let clock = model.clock;
    let header_words = model.format.channel_header_words;
    let mut pulses = Vec::new();
    let mut idx = 0;

    while idx < words.len() {
        if !is_event_header(words[idx]) {
            idx += 1;
            continue;
        }
        let size = (words[idx] & 0x0FFF_FFFF) as usize;
        if size < 4 || idx + size > words.len() {
            return Err(StraxError::malformed(
                bid,
                format!(
                    "event at word {} claims {} words, {} left in buffer",
                    idx,
                    size,
                    words.len() - idx
                ),
            ));
        }
        let event = &words[idx..idx + size];
        if event[1] & BOARD_FAIL_BIT != 0 {
            return Err(StraxError::BoardFail(bid));
        }

        let mut mask = event[1] & 0xFF;
        if let Some(msb) = model.format.channel_mask_msb_idx {
            mask |= ((event[msb] >> 24) & 0xFF) << 8;
        }
        let event_time = event[3] & clock.mask();
        let event_counter =
            clock.relative_counter(packet.header_time, packet.clock_counter, event_time);

        let channels: Vec<u32> = (0..model.n_channels).filter(|ch| mask & (1 << *ch) != 0).collect();
        let body = &event[4..];

        if header_words == 0 {
            // Fixed-size channel blocks, all at the event time
            if !channels.is_empty() {
                let per_channel = body.len() / channels.len();
                for (i, channel) in channels.iter().enumerate() {
                    pulses.push(ChannelPulse {
                        channel: *channel,
                        time_ns: clock.to_ns(event_counter, event_time),
                        words: &body[i * per_channel..(i + 1) * per_channel],
                    });
                }
            }
        } else {
            let mut pos = 0;
            for channel in channels {
                let Some(&size_word) = body.get(pos) else {
                    return Err(StraxError::malformed(
                        bid,
                        format!("channel {} header missing in event at word {}", channel, idx),
                    ));
                };
                let ch_size = (size_word & 0x007F_FFFF) as usize;
                if ch_size < header_words || pos + ch_size > body.len() {
                    return Err(StraxError::malformed(
                        bid,
                        format!(
                            "channel {} claims {} words, {} left in event",
                            channel,
                            ch_size,
                            body.len() - pos
                        ),
                    ));
                }
                let ch_time = body[pos + 1] & clock.mask();
                let ch_counter = clock.relative_counter(event_time, event_counter, ch_time);
                pulses.push(ChannelPulse {
                    channel,
                    time_ns: clock.to_ns(ch_counter, ch_time),
                    words: &body[pos + header_words..pos + ch_size],
                });
                pos += ch_size;
            }
        }

        idx += size;
    }

    Ok(pulses)
}
