//! V1730 DPP-PSD board aggregates
//!
//! ```text
//! board aggregate  [0xA | size:28] [board:5 .. pattern:15 .. pair mask:8] [counter:23] [time tag]
//!   channel agg    [1 | size:22]   [format: bits 0..12 = samples / 8]
//!     event        [odd:1 | time tag:31] [samples/2 waveform words] [extras] [charges]
//! ```
//! The extras word carries the baseline in its low half; the charge word carries
//! the short gate integral in bits 0..15 and the long gate integral in 16..32.

use tracing::trace;

use super::{
    cursor::WordCursor,
    for_each_aggregate, next_word, report_sequence,
    sequence::{SequenceStats, TriggerSequence},
    take_words,
    unpack::unpack_psd,
    ChannelRate, DecodeState, OverflowPolicy,
};
use crate::{
    error::{DaqError, DecodeError},
    settings::{V1730Settings, V1730_CHANNELS},
    sink::RecordSink,
    store::{Columns, EventMeta, RecordLayout, RecordStore},
};

pub const BITS: u32 = 14;
pub const NS_PER_SAMPLE: f64 = 2.0;

const PAIRS: usize = V1730_CHANNELS / 2;
const COUNTER_MASK: u32 = 0x7F_FFFF;
const FORMAT_FLAG: u32 = 0x8000_0000;
const CHANNEL_SIZE_MASK: u32 = 0x3F_FFFF;
const ODD_CHANNEL: u32 = 0x8000_0000;
const TIME_TAG_MASK: u32 = 0x7FFF_FFFF;
const BOARD_HEADER_WORDS: usize = 4;
const CHANNEL_HEADER_WORDS: usize = 2;
// time tag, extras, charges
const EVENT_OVERHEAD_WORDS: usize = 3;

#[derive(Debug)]
pub struct PsdDecoder {
    state: DecodeState,
    settings: V1730Settings,
    chan2idx: [Option<usize>; V1730_CHANNELS],
    idx2chan: Vec<usize>,
    sequence: TriggerSequence,
}

impl PsdDecoder {
    /// Allocate `capacity` events for every enabled channel of finalized settings.
    pub fn new(
        card: &str,
        settings: &V1730Settings,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> Self {
        let mut chan2idx = [None; V1730_CHANNELS];
        let mut idx2chan = Vec::new();
        let mut layouts = Vec::new();
        for ch in settings.enabled_channels() {
            chan2idx[ch] = Some(idx2chan.len());
            idx2chan.push(ch);
            layouts.push(RecordLayout {
                label: format!("ch{ch}"),
                n_samples: settings.channels[ch].record_length as usize,
                traces: 1,
                capacity,
                columns: Columns::PSD,
            });
        }
        Self {
            state: DecodeState::new(card, RecordStore::new(layouts), overflow),
            settings: settings.clone(),
            chan2idx,
            idx2chan,
            sequence: TriggerSequence::new(COUNTER_MASK),
        }
    }

    pub fn card(&self) -> &str {
        &self.state.card
    }

    pub fn store(&self) -> &RecordStore {
        &self.state.store
    }

    pub fn sequence_stats(&self) -> &SequenceStats {
        self.sequence.stats()
    }

    pub fn rates(&mut self) -> Vec<ChannelRate> {
        self.state.rates()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, DecodeError> {
        self.state.begin_pass();
        let card = self.state.card.clone();
        for_each_aggregate(&card, bytes, |agg| self.decode_board_aggregate(agg))
    }

    fn decode_board_aggregate(&mut self, mut agg: WordCursor<'_>) -> Result<(), DecodeError> {
        let card = self.state.card.as_str();
        let declared = agg.len();
        let mut header = take_words(&mut agg, BOARD_HEADER_WORDS, card, "board aggregate")?;
        header.skip(1);
        let mask = next_word(&mut header, card, "board aggregate")? & 0xFF;
        let count = next_word(&mut header, card, "board aggregate")? & COUNTER_MASK;
        report_sequence(card, count, self.sequence.observe(count));
        trace!(card, mask, count, size = declared, "Board aggregate");

        for pair in (0..PAIRS).filter(|p| mask & (1 << p) != 0) {
            let size_word = agg.peek().ok_or_else(|| DecodeError::Truncated {
                card: self.state.card.clone(),
                frame: "channel aggregate",
            })?;
            if size_word & FORMAT_FLAG == 0 {
                return Err(DecodeError::MissingFormat {
                    card: self.state.card.clone(),
                    word: size_word,
                });
            }
            let size = (size_word & CHANNEL_SIZE_MASK) as usize;
            let chan = take_words(&mut agg, size, &self.state.card, "channel aggregate")?;
            self.decode_channel_aggregate(chan, pair)?;
        }

        if agg.remaining() != 0 {
            return Err(DecodeError::FrameSize {
                card: self.state.card.clone(),
                frame: "board aggregate",
                declared,
                consumed: agg.position(),
            });
        }
        Ok(())
    }

    fn decode_channel_aggregate(
        &mut self,
        mut chan: WordCursor<'_>,
        pair: usize,
    ) -> Result<(), DecodeError> {
        let (card, policy, warned, store) = self.state.parts();
        let declared = chan.len();
        let mut header = take_words(&mut chan, CHANNEL_HEADER_WORDS, card, "channel aggregate")?;
        header.skip(1);
        let format = next_word(&mut header, card, "channel aggregate")?;
        let samples = ((format & 0xFFF) * 8) as usize;
        let event_words = samples / 2 + EVENT_OVERHEAD_WORDS;

        if chan.remaining() % event_words != 0 {
            return Err(DecodeError::FrameSize {
                card: card.to_owned(),
                frame: "channel aggregate",
                declared,
                consumed: CHANNEL_HEADER_WORDS + chan.remaining() / event_words * event_words,
            });
        }

        while chan.remaining() > 0 {
            let mut event = take_words(&mut chan, event_words, card, "event")?;
            let head = next_word(&mut event, card, "event")?;
            let ch = 2 * pair + usize::from(head & ODD_CHANNEL != 0);
            let idx = self.chan2idx[ch].ok_or_else(|| DecodeError::DisabledChannel {
                card: card.to_owned(),
                kind: "channel",
                index: ch,
            })?;
            let Some(records) = store.get_mut(idx) else {
                return Err(DecodeError::DisabledChannel {
                    card: card.to_owned(),
                    kind: "channel",
                    index: ch,
                });
            };
            if records.n_samples() != samples {
                return Err(DecodeError::SampleMismatch {
                    card: card.to_owned(),
                    kind: "channel",
                    index: ch,
                    received: samples,
                    expected: records.n_samples(),
                });
            }
            let wave = event.take_bytes(samples / 2).ok_or_else(|| DecodeError::Truncated {
                card: card.to_owned(),
                frame: "event",
            })?;
            let extras = next_word(&mut event, card, "event")?;
            let charges = next_word(&mut event, card, "event")?;
            match records.push() {
                Some(mut slot) => {
                    unpack_psd(wave, slot.trace_mut(0));
                    slot.set_meta(EventMeta {
                        timestamp: head & TIME_TAG_MASK,
                        baseline: (extras & 0xFFFF) as u16,
                        charge_short: (charges & 0x7FFF) as u16,
                        charge_long: (charges >> 16) as u16,
                        ..Default::default()
                    });
                }
                None => DecodeState::overflow(card, policy, warned, records)?,
            }
        }
        Ok(())
    }

    /// Write the first `n` events of every channel, then drop them from the store.
    pub fn write_out(&mut self, sink: &mut dyn RecordSink, n: usize) -> Result<(), DaqError> {
        self.state.check_ready(n)?;
        let root = format!("/{}", self.state.card);
        sink.create_group(&root)?;
        sink.attr_u32(&root, "bits", BITS)?;
        sink.attr_f64(&root, "ns_sample", NS_PER_SAMPLE)?;
        let longest = self
            .state
            .store
            .iter()
            .map(|r| r.n_samples())
            .max()
            .unwrap_or(0);
        sink.attr_u32(&root, "samples", longest as u32)?;

        for (records, ch) in self.state.store.iter().zip(&self.idx2chan) {
            let settings = &self.settings.channels[*ch];
            let path = format!("{root}/ch{ch}");
            sink.create_group(&path)?;
            sink.attr_u32(&path, "offset", settings.dc_offset)?;
            sink.attr_u32(&path, "samples", settings.record_length)?;
            sink.attr_u32(&path, "presamples", settings.pre_trigger)?;
            sink.attr_u32(&path, "threshold", settings.trigger_threshold)?;

            let ns = records.n_samples();
            sink.dataset_u16(&format!("{path}/samples"), &[n, ns], &records.trace(0)[..n * ns])?;
            sink.dataset_u16(&format!("{path}/baselines"), &[n], &records.baselines()[..n])?;
            sink.dataset_u16(&format!("{path}/qshorts"), &[n], &records.charge_short()[..n])?;
            sink.dataset_u16(&format!("{path}/qlongs"), &[n], &records.charge_long()[..n])?;
            sink.dataset_u32(&format!("{path}/times"), &[n], &records.timestamps()[..n])?;
        }
        self.state.store.drain(n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoder::FrameDecoder,
        sim::{encode_psd_aggregate, to_bytes, PsdEvent},
        sink::MemorySink,
    };

    fn settings(channels: &[usize], record_length: u32) -> V1730Settings {
        let mut s = V1730Settings::default();
        for &ch in channels {
            s.channels[ch].enabled = true;
            s.channels[ch & !1].record_length = record_length;
            s.channels[ch | 1].record_length = record_length;
        }
        s
    }

    fn event(channel: usize, timestamp: u32, samples: usize) -> PsdEvent {
        PsdEvent {
            channel,
            timestamp,
            samples: (0..samples)
                .map(|s| ((s + channel * 1000 + timestamp as usize) % 0x4000) as u16)
                .collect(),
            baseline: 100 + channel as u16,
            charge_short: timestamp as u16,
            charge_long: 2 * timestamp as u16,
        }
    }

    fn stream(aggregates: &[Vec<PsdEvent>]) -> Vec<u8> {
        let words: Vec<u32> = aggregates
            .iter()
            .enumerate()
            .flat_map(|(i, evs)| encode_psd_aggregate(i as u32, 1000 * i as u32, evs))
            .collect();
        to_bytes(&words)
    }

    #[test]
    fn test_two_channels_three_aggregates() {
        let s = settings(&[0, 1], 200);
        let mut dec = FrameDecoder::from(PsdDecoder::new("psd0", &s, 10, OverflowPolicy::Fatal));
        let aggs: Vec<Vec<PsdEvent>> = (0..3u32)
            .map(|i| vec![event(0, 10 + i, 200), event(1, 20 + i, 200)])
            .collect();
        let bytes = stream(&aggs);
        assert_eq!(dec.decode(&bytes).unwrap(), bytes.len());
        assert_eq!(dec.events_ready(), 3);
        for r in dec.store().iter() {
            assert_eq!(r.len(), 3);
        }

        let mut sink = MemorySink::new("out");
        dec.write_out(&mut sink, 3).unwrap();
        assert_eq!(sink.u32s("/psd0/ch0/times"), Some(&[10, 11, 12][..]));
        assert_eq!(sink.u32s("/psd0/ch1/times"), Some(&[20, 21, 22][..]));
        assert_eq!(sink.dataset("/psd0/ch0/samples").unwrap().shape(), &[3, 200]);
        assert_eq!(
            &sink.u16s("/psd0/ch1/samples").unwrap()[200..400],
            &event(1, 21, 200).samples[..]
        );
        assert_eq!(sink.u16s("/psd0/ch0/baselines"), Some(&[100, 100, 100][..]));
        assert_eq!(sink.u16s("/psd0/ch1/qlongs"), Some(&[40, 42, 44][..]));
        assert_eq!(dec.events_ready(), 0);
    }

    #[test]
    fn test_ramp_reproduced_exactly() {
        let s = settings(&[4], 64);
        let mut dec = PsdDecoder::new("psd0", &s, 4, OverflowPolicy::Fatal);
        let mut ev = event(4, 7, 64);
        ev.samples = (0..64).collect();
        let bytes = stream(&[vec![ev]]);
        dec.decode(&bytes).unwrap();
        let expected: Vec<u16> = (0..64).collect();
        assert_eq!(dec.store().get(0).unwrap().trace(0), &expected[..]);
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let s = settings(&[2, 3, 9], 32);
        let aggs: Vec<Vec<PsdEvent>> = (0..5u32)
            .map(|i| vec![event(2, i, 32), event(3, i, 32), event(9, 100 + i, 32)])
            .collect();
        let bytes = stream(&aggs);
        let run = || {
            let mut dec = PsdDecoder::new("psd0", &s, 8, OverflowPolicy::Fatal);
            dec.decode(&bytes).unwrap();
            let mut sink = MemorySink::new("out");
            dec.write_out(&mut sink, 5).unwrap();
            sink.dataset_paths()
                .map(|p| (p.to_owned(), sink.dataset(p).cloned()))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_partial_aggregate_left_for_next_pass() {
        let s = settings(&[0], 16);
        let mut dec = PsdDecoder::new("psd0", &s, 4, OverflowPolicy::Fatal);
        let bytes = stream(&[vec![event(0, 1, 16)], vec![event(0, 2, 16)]]);
        let first = bytes.len() / 2;
        let cut = first + 12;
        assert_eq!(dec.decode(&bytes[..cut]).unwrap(), first);
        assert_eq!(dec.decode(&bytes[first..]).unwrap(), bytes.len() - first);
        assert_eq!(dec.store().get(0).unwrap().timestamps(), &[1, 2]);
    }

    #[test]
    fn test_padding_skipped() {
        let s = settings(&[0], 8);
        let mut dec = PsdDecoder::new("psd0", &s, 4, OverflowPolicy::Fatal);
        let mut words = vec![0xFFFF_FFFF];
        words.extend(encode_psd_aggregate(0, 0, &[event(0, 5, 8)]));
        words.push(0xFFFF_FFFF);
        let bytes = to_bytes(&words);
        assert_eq!(dec.decode(&bytes).unwrap(), bytes.len());
        assert_eq!(dec.store().get(0).unwrap().timestamps(), &[5]);
    }

    #[test]
    fn test_bad_tag_is_fatal() {
        let s = settings(&[0], 8);
        let mut dec = PsdDecoder::new("psd0", &s, 4, OverflowPolicy::Fatal);
        let bytes = to_bytes(&[0x5000_0004, 0, 0, 0]);
        assert!(matches!(
            dec.decode(&bytes),
            Err(DecodeError::MissingTag {
                word: 0x5000_0004,
                offset: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_disabled_channel_is_fatal() {
        let s = settings(&[0], 8);
        let mut dec = PsdDecoder::new("psd0", &s, 4, OverflowPolicy::Fatal);
        let bytes = stream(&[vec![event(1, 3, 8)]]);
        assert_eq!(
            dec.decode(&bytes),
            Err(DecodeError::DisabledChannel {
                card: "psd0".into(),
                kind: "channel",
                index: 1
            })
        );
    }

    #[test]
    fn test_sample_mismatch_is_fatal() {
        let s = settings(&[6], 16);
        let mut dec = PsdDecoder::new("psd0", &s, 4, OverflowPolicy::Fatal);
        let bytes = stream(&[vec![event(6, 3, 24)]]);
        assert!(matches!(
            dec.decode(&bytes),
            Err(DecodeError::SampleMismatch {
                index: 6,
                received: 24,
                expected: 16,
                ..
            })
        ));
    }

    #[test]
    fn test_declared_size_must_match() {
        let s = settings(&[0], 8);
        let mut dec = PsdDecoder::new("psd0", &s, 4, OverflowPolicy::Fatal);
        let mut words = encode_psd_aggregate(0, 0, &[event(0, 1, 8)]);
        // Claim one extra word and supply it
        words[0] += 1;
        words.push(0);
        assert!(matches!(
            dec.decode(&to_bytes(&words)),
            Err(DecodeError::FrameSize {
                frame: "board aggregate",
                ..
            })
        ));
    }

    #[test]
    fn test_overflow_is_fatal_without_corrupting_others() {
        let s = settings(&[0, 2], 8);
        let mut dec = PsdDecoder::new("psd0", &s, 2, OverflowPolicy::Fatal);
        let ok = stream(&[
            vec![event(0, 1, 8), event(2, 1, 8)],
            vec![event(0, 2, 8), event(2, 2, 8)],
        ]);
        dec.decode(&ok).unwrap();
        let over = stream(&[vec![event(2, 3, 8)]]);
        assert!(matches!(
            dec.decode(&over),
            Err(DecodeError::Overflow { capacity: 2, ref label, .. }) if label == "ch2"
        ));
        let ch0 = dec.store().get(0).unwrap();
        assert_eq!(ch0.timestamps(), &[1, 2]);
        assert_eq!(ch0.trace(0), &[&event(0, 1, 8).samples[..], &event(0, 2, 8).samples[..]].concat()[..]);
        assert_eq!(dec.store().get(1).unwrap().timestamps(), &[1, 2]);
    }

    #[test]
    fn test_overflow_counting_mode() {
        let s = settings(&[0], 8);
        let mut dec = PsdDecoder::new("psd0", &s, 1, OverflowPolicy::Count);
        let bytes = stream(&[vec![event(0, 1, 8)], vec![event(0, 2, 8)], vec![event(0, 3, 8)]]);
        dec.decode(&bytes).unwrap();
        let r = dec.store().get(0).unwrap();
        assert_eq!(r.timestamps(), &[1]);
        assert_eq!(r.grabbed(), 3);
        assert_eq!(r.dropped(), 2);
    }

    #[test]
    fn test_zero_capacity_monitors() {
        let s = settings(&[0], 8);
        let mut dec = PsdDecoder::new("psd0", &s, 0, OverflowPolicy::Fatal);
        dec.decode(&stream(&[vec![event(0, 1, 8)], vec![event(0, 2, 8)]]))
            .unwrap();
        assert_eq!(dec.store().get(0).unwrap().grabbed(), 2);
        assert_eq!(dec.rates()[0].events, 2);
        assert_eq!(dec.rates()[0].events, 0);
    }

    #[test]
    fn test_counter_gaps_are_not_fatal() {
        let s = settings(&[0], 8);
        let mut dec = PsdDecoder::new("psd0", &s, 8, OverflowPolicy::Fatal);
        let mut words = encode_psd_aggregate(1, 0, &[event(0, 1, 8)]);
        words.extend(encode_psd_aggregate(4, 0, &[event(0, 2, 8)]));
        words.extend(encode_psd_aggregate(4, 0, &[event(0, 3, 8)]));
        dec.decode(&to_bytes(&words)).unwrap();
        assert_eq!(dec.sequence_stats().missed, 2);
        assert_eq!(dec.sequence_stats().duplicates, 1);
        assert_eq!(dec.store().get(0).unwrap().len(), 3);
    }

    #[test]
    fn test_write_out_keeps_surplus() {
        let s = settings(&[0], 8);
        let mut dec = PsdDecoder::new("psd0", &s, 8, OverflowPolicy::Fatal);
        let aggs: Vec<Vec<PsdEvent>> = (0..5u32).map(|i| vec![event(0, i, 8)]).collect();
        dec.decode(&stream(&aggs)).unwrap();
        let mut sink = MemorySink::new("out");
        assert!(matches!(
            dec.write_out(&mut sink, 6),
            Err(DaqError::Decode(DecodeError::Underrun { available: 5, .. }))
        ));
        dec.write_out(&mut sink, 3).unwrap();
        assert_eq!(dec.store().get(0).unwrap().timestamps(), &[3, 4]);
        assert_eq!(
            dec.store().get(0).unwrap().trace(0),
            &[&event(0, 3, 8).samples[..], &event(0, 4, 8).samples[..]].concat()[..]
        );
    }
}
