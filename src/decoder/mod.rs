//! Frame decoding for both supported digitizer models
//!
//! A decoder walks complete board aggregates from the front of a card's readable
//! bytes, appends events into its [`RecordStore`], and reports how many bytes it
//! consumed. An aggregate that is not completely in the buffer yet is left alone
//! for the next pass.

pub mod cursor;
pub mod drs4;
pub mod psd;
pub mod sequence;
pub mod unpack;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{DaqError, DecodeError},
    sink::RecordSink,
    store::{ChannelRecords, RecordStore},
};
use cursor::WordCursor;
use sequence::{Sequence, SequenceStats};

pub use drs4::Drs4Decoder;
pub use psd::PsdDecoder;

/// Hardware sometimes pads board aggregates out to an alignment boundary
pub const PADDING_WORD: u32 = 0xFFFF_FFFF;
/// Top nibble of every board aggregate header
pub const AGGREGATE_TAG: u32 = 0xA000_0000;
pub const TAG_MASK: u32 = 0xF000_0000;
/// Board aggregate size field, in words
pub const AGGREGATE_SIZE_MASK: u32 = 0x0FFF_FFFF;

/// What to do with an event whose channel store is already full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// The run cannot keep pace; stop it
    #[default]
    Fatal,
    /// Count the event without storing it
    Count,
}

/// Events gathered for one channel since the previous report
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelRate {
    pub label: String,
    pub events: u64,
    pub hz: f64,
    pub total: u64,
}

/// Shared state every model carries around its record store.
#[derive(Debug)]
pub(crate) struct DecodeState {
    pub card: String,
    pub store: RecordStore,
    pub overflow: OverflowPolicy,
    overflowed: bool,
    last_report: Instant,
    last_grabbed: Vec<u64>,
}

impl DecodeState {
    pub fn new(card: &str, store: RecordStore, overflow: OverflowPolicy) -> Self {
        let last_grabbed = vec![0; store.len()];
        Self {
            card: card.to_owned(),
            store,
            overflow,
            overflowed: false,
            last_report: Instant::now(),
            last_grabbed,
        }
    }

    /// Reset the once-per-pass overflow warning.
    pub fn begin_pass(&mut self) {
        self.overflowed = false;
    }

    /// Decide what happens to an event that found `records` full. Returns an
    /// error only under [`OverflowPolicy::Fatal`] with a nonzero capacity.
    pub fn overflow(
        card: &str,
        policy: OverflowPolicy,
        warned: &mut bool,
        records: &mut ChannelRecords,
    ) -> Result<(), DecodeError> {
        if records.capacity() > 0 && policy == OverflowPolicy::Fatal {
            return Err(DecodeError::Overflow {
                card: card.to_owned(),
                label: records.label().to_owned(),
                capacity: records.capacity(),
            });
        }
        records.count_dropped();
        if records.capacity() > 0 && !*warned {
            *warned = true;
            warn!(
                card,
                channel = records.label(),
                "Record buffer full, counting events without storing them"
            );
        }
        Ok(())
    }

    /// Split borrow used by the model decoders while walking a frame
    pub fn parts(&mut self) -> (&str, OverflowPolicy, &mut bool, &mut RecordStore) {
        (
            &self.card,
            self.overflow,
            &mut self.overflowed,
            &mut self.store,
        )
    }

    pub fn rates(&mut self) -> Vec<ChannelRate> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_report).as_secs_f64();
        self.last_report = now;
        let mut rates = Vec::with_capacity(self.store.len());
        for (records, last) in self.store.iter().zip(self.last_grabbed.iter_mut()) {
            let events = records.grabbed() - *last;
            *last = records.grabbed();
            let hz = if dt > 0.0 { events as f64 / dt } else { 0.0 };
            debug!(
                card = self.card.as_str(),
                "{}\tev: {} / {:.1} Hz / {} total",
                records.label(),
                events,
                hz,
                records.grabbed()
            );
            rates.push(ChannelRate {
                label: records.label().to_owned(),
                events,
                hz,
                total: records.grabbed(),
            });
        }
        rates
    }

    /// Every channel must hold `n` events before any of them is written.
    pub fn check_ready(&self, n: usize) -> Result<(), DecodeError> {
        for records in self.store.iter() {
            if records.len() < n {
                return Err(DecodeError::Underrun {
                    card: self.card.clone(),
                    label: records.label().to_owned(),
                    requested: n,
                    available: records.len(),
                });
            }
        }
        Ok(())
    }
}

/// Hand every complete board aggregate at the front of `bytes` to `f`, returning
/// the bytes consumed. Stops at the first aggregate that is not completely
/// present.
pub(crate) fn for_each_aggregate<'a>(
    card: &str,
    bytes: &'a [u8],
    mut f: impl FnMut(WordCursor<'a>) -> Result<(), DecodeError>,
) -> Result<usize, DecodeError> {
    let mut cur = WordCursor::new(bytes);
    while let Some(first) = cur.peek() {
        let mut pad = 0;
        let mut tag = first;
        if tag == PADDING_WORD {
            pad = 1;
            match cur.peek_at(1) {
                Some(next) => tag = next,
                None => {
                    // Trailing pad on its own
                    cur.skip(1);
                    break;
                }
            }
        }
        if tag & TAG_MASK != AGGREGATE_TAG {
            return Err(DecodeError::MissingTag {
                card: card.to_owned(),
                word: tag,
                offset: (cur.position() + pad) * cursor::WORD_SIZE,
            });
        }
        let size = (tag & AGGREGATE_SIZE_MASK) as usize;
        if cur.remaining() < pad + size {
            break;
        }
        cur.skip(pad);
        let Some(aggregate) = cur.take(size) else {
            break;
        };
        f(aggregate)?;
    }
    Ok(cur.byte_position())
}

/// Fail if the aggregate at the front of `bytes` could never fit in a host
/// buffer of `capacity` bytes. Such a frame would otherwise wait forever.
pub fn check_aggregate_fits(card: &str, bytes: &[u8], capacity: usize) -> Result<(), DecodeError> {
    let cur = WordCursor::new(bytes);
    let (pad, tag) = match cur.peek() {
        Some(PADDING_WORD) => match cur.peek_at(1) {
            Some(tag) => (1, tag),
            None => return Ok(()),
        },
        Some(tag) => (0, tag),
        None => return Ok(()),
    };
    if tag & TAG_MASK != AGGREGATE_TAG {
        return Ok(());
    }
    let declared = (tag & AGGREGATE_SIZE_MASK) as usize;
    let capacity = capacity / cursor::WORD_SIZE;
    if pad + declared > capacity {
        return Err(DecodeError::Oversized {
            card: card.to_owned(),
            declared,
            capacity,
        });
    }
    Ok(())
}

/// Pull the next word of a frame or fail as truncated.
pub(crate) fn next_word(
    cur: &mut WordCursor<'_>,
    card: &str,
    frame: &'static str,
) -> Result<u32, DecodeError> {
    cur.next_word().ok_or_else(|| DecodeError::Truncated {
        card: card.to_owned(),
        frame,
    })
}

pub(crate) fn take_words<'a>(
    cur: &mut WordCursor<'a>,
    n: usize,
    card: &str,
    frame: &'static str,
) -> Result<WordCursor<'a>, DecodeError> {
    cur.take(n).ok_or_else(|| DecodeError::Truncated {
        card: card.to_owned(),
        frame,
    })
}

pub(crate) fn report_sequence(card: &str, count: u32, seq: Sequence) {
    match seq {
        Sequence::Duplicate => warn!(card, count, "Duplicate trigger"),
        Sequence::Orphaned => warn!(card, count, "Orphaned trigger"),
        Sequence::Missed(n) => warn!(card, count, "Missed {} triggers", n),
        Sequence::First | Sequence::Next => (),
    }
}

/// One decoder per card, closed over the supported models.
#[derive(Debug)]
pub enum FrameDecoder {
    Psd(PsdDecoder),
    Drs4(Drs4Decoder),
}

impl FrameDecoder {
    pub fn card(&self) -> &str {
        match self {
            Self::Psd(d) => d.card(),
            Self::Drs4(d) => d.card(),
        }
    }

    /// Decode every complete board aggregate at the front of `bytes`, returning
    /// the number of bytes consumed.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecodeError> {
        match self {
            Self::Psd(d) => d.decode(bytes),
            Self::Drs4(d) => d.decode(bytes),
        }
    }

    /// Events every channel of this card can supply to a flush
    pub fn events_ready(&self) -> usize {
        self.store().events_ready()
    }

    pub fn store(&self) -> &RecordStore {
        match self {
            Self::Psd(d) => d.store(),
            Self::Drs4(d) => d.store(),
        }
    }

    /// Write the first `n` events of every channel and drop them from the store.
    pub fn write_out(&mut self, sink: &mut dyn RecordSink, n: usize) -> Result<(), DaqError> {
        match self {
            Self::Psd(d) => d.write_out(sink, n),
            Self::Drs4(d) => d.write_out(sink, n),
        }
    }

    /// Per-channel event rates since the last call
    pub fn rates(&mut self) -> Vec<ChannelRate> {
        match self {
            Self::Psd(d) => d.rates(),
            Self::Drs4(d) => d.rates(),
        }
    }

    pub fn sequence_stats(&self) -> &SequenceStats {
        match self {
            Self::Psd(d) => d.sequence_stats(),
            Self::Drs4(d) => d.sequence_stats(),
        }
    }
}

impl From<PsdDecoder> for FrameDecoder {
    fn from(d: PsdDecoder) -> Self {
        Self::Psd(d)
    }
}

impl From<Drs4Decoder> for FrameDecoder {
    fn from(d: Drs4Decoder) -> Self {
        Self::Drs4(d)
    }
}
