//! V1742 DRS4 events
//!
//! ```text
//! event            [0xA | size:28] [board:5 .. pattern:14 .. group mask:4] [counter:22] [time tag]
//!   group          [start cell:10 @20 | freq:2 @16 | tr:1 @12 | size:12]
//!                  [size words: 8 channels x 12 bits per 3 words]
//!                  [size/8 words of TR samples, if tr]
//!                  [group trigger time tag]
//! ```
//! Groups 0 and 1 digitize fast trigger TR0, groups 2 and 3 digitize TR1.

use tracing::trace;

use super::{
    cursor::WordCursor,
    for_each_aggregate, next_word, report_sequence,
    sequence::{SequenceStats, TriggerSequence},
    take_words,
    unpack::{unpack_drs4_channels, unpack_drs4_serial},
    ChannelRate, DecodeState, OverflowPolicy,
};
use crate::{
    error::{DaqError, DecodeError},
    settings::{V1742Settings, V1742_GROUPS, V1742_GROUP_CHANNELS},
    sink::RecordSink,
    store::{Columns, EventMeta, RecordLayout, RecordStore},
};

pub const BITS: u32 = 12;

const COUNTER_MASK: u32 = 0x3F_FFFF;
const GROUP_SIZE_MASK: u32 = 0xFFF;
const TR_FLAG: u32 = 1 << 12;
const START_CELL_SHIFT: u32 = 20;
const START_CELL_MASK: u32 = 0x3FF;
const EVENT_HEADER_WORDS: usize = 4;

#[derive(Debug)]
pub struct Drs4Decoder {
    state: DecodeState,
    settings: V1742Settings,
    gr2idx: [Option<usize>; V1742_GROUPS],
    idx2gr: Vec<usize>,
    tr_readout: bool,
    sequence: TriggerSequence,
}

impl Drs4Decoder {
    pub fn new(
        card: &str,
        settings: &V1742Settings,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> Self {
        let tr_readout = settings.tr_readout;
        let mut gr2idx = [None; V1742_GROUPS];
        let mut idx2gr = Vec::new();
        let mut layouts = Vec::new();
        for gr in settings.enabled_groups() {
            gr2idx[gr] = Some(idx2gr.len());
            idx2gr.push(gr);
            layouts.push(RecordLayout {
                label: format!("gr{gr}"),
                n_samples: settings.samples_per_event(),
                traces: V1742_GROUP_CHANNELS + usize::from(tr_readout),
                capacity,
                columns: Columns::DRS4,
            });
        }
        Self {
            state: DecodeState::new(card, RecordStore::new(layouts), overflow),
            settings: settings.clone(),
            gr2idx,
            idx2gr,
            tr_readout,
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
        for_each_aggregate(&card, bytes, |event| self.decode_event(event))
    }

    fn decode_event(&mut self, mut event: WordCursor<'_>) -> Result<(), DecodeError> {
        let card = self.state.card.as_str();
        let declared = event.len();
        let mut header = take_words(&mut event, EVENT_HEADER_WORDS, card, "event")?;
        header.skip(1);
        let mask = next_word(&mut header, card, "event")? & 0xF;
        let count = next_word(&mut header, card, "event")? & COUNTER_MASK;
        let time_tag = next_word(&mut header, card, "event")?;
        report_sequence(card, count, self.sequence.observe(count));
        trace!(card, mask, count, size = declared, "Event");

        for gr in (0..V1742_GROUPS).filter(|g| mask & (1 << g) != 0) {
            self.decode_group(&mut event, gr, count, time_tag)?;
        }

        if event.remaining() != 0 {
            return Err(DecodeError::FrameSize {
                card: self.state.card.clone(),
                frame: "event",
                declared,
                consumed: event.position(),
            });
        }
        Ok(())
    }

    fn decode_group(
        &mut self,
        event: &mut WordCursor<'_>,
        gr: usize,
        count: u32,
        time_tag: u32,
    ) -> Result<(), DecodeError> {
        let (card, policy, warned, store) = self.state.parts();
        let disabled = || DecodeError::DisabledChannel {
            card: card.to_owned(),
            kind: "group",
            index: gr,
        };
        let idx = self.gr2idx[gr].ok_or_else(disabled)?;
        let records = store.get_mut(idx).ok_or_else(disabled)?;

        let head = next_word(event, card, "group")?;
        let size = (head & GROUP_SIZE_MASK) as usize;
        if size % 3 != 0 || size / 3 != records.n_samples() {
            return Err(DecodeError::SampleMismatch {
                card: card.to_owned(),
                kind: "group",
                index: gr,
                received: size / 3,
                expected: records.n_samples(),
            });
        }
        let tr = head & TR_FLAG != 0;
        if tr && !self.tr_readout {
            return Err(DecodeError::UnexpectedTr {
                card: card.to_owned(),
                tr: gr / 2,
                group: gr,
            });
        }
        if !tr && self.tr_readout {
            return Err(DecodeError::MissingTr {
                card: card.to_owned(),
                tr: gr / 2,
                group: gr,
            });
        }

        let truncated = || DecodeError::Truncated {
            card: card.to_owned(),
            frame: "group",
        };
        let data = event.take_bytes(size).ok_or_else(truncated)?;
        let tr_data = if tr {
            Some(event.take_bytes(size / 8).ok_or_else(truncated)?)
        } else {
            None
        };
        // Group trigger time tag, superseded by the event's
        next_word(event, card, "group")?;

        match records.push() {
            Some(mut slot) => {
                {
                    let mut traces = slot.traces_mut();
                    unpack_drs4_channels(data, &mut traces[..V1742_GROUP_CHANNELS]);
                    if let Some(tr_data) = tr_data {
                        unpack_drs4_serial(tr_data, &mut *traces[V1742_GROUP_CHANNELS]);
                    }
                }
                slot.set_meta(EventMeta {
                    timestamp: time_tag,
                    trigger_count: count,
                    start_index: ((head >> START_CELL_SHIFT) & START_CELL_MASK) as u16,
                    ..Default::default()
                });
            }
            None => DecodeState::overflow(card, policy, warned, records)?,
        }
        Ok(())
    }

    /// Write the first `n` events of every group, then drop them from the store.
    pub fn write_out(&mut self, sink: &mut dyn RecordSink, n: usize) -> Result<(), DaqError> {
        self.state.check_ready(n)?;
        let ns = self.settings.samples_per_event();
        let root = format!("/{}", self.state.card);
        sink.create_group(&root)?;
        sink.attr_u32(&root, "bits", BITS)?;
        sink.attr_f64(&root, "ns_sample", self.settings.ns_per_sample())?;
        sink.attr_u32(&root, "samples", ns as u32)?;

        for (records, gr) in self.state.store.iter().zip(&self.idx2gr) {
            let group = format!("{root}/gr{gr}");
            sink.create_group(&group)?;
            for ch in 0..V1742_GROUP_CHANNELS {
                let path = format!("{group}/ch{ch}");
                sink.create_group(&path)?;
                sink.attr_u32(&path, "offset", self.settings.dc_offset(*gr, ch) as u32)?;
                sink.dataset_u16(&format!("{path}/samples"), &[n, ns], &records.trace(ch)[..n * ns])?;
            }
            sink.dataset_u16(&format!("{group}/start_index"), &[n], &records.start_index()[..n])?;
            sink.dataset_u32(&format!("{group}/trigger_time"), &[n], &records.timestamps()[..n])?;
            sink.dataset_u32(&format!("{group}/trigger_count"), &[n], &records.trigger_counts()[..n])?;
            if self.tr_readout {
                sink.attr_u32(&group, "tr", (*gr / 2) as u32)?;
                sink.dataset_u16(
                    &format!("{group}/tr_samples"),
                    &[n, ns],
                    &records.trace(V1742_GROUP_CHANNELS)[..n * ns],
                )?;
            }
        }
        self.state.store.drain(n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sim::{encode_drs4_event, to_bytes, Drs4Group},
        sink::MemorySink,
    };

    const NS: usize = 136;

    fn settings(groups: &[usize], tr_readout: bool) -> V1742Settings {
        let mut s = V1742Settings {
            num_samples: 3,
            tr_readout,
            ..Default::default()
        };
        for &gr in groups {
            s.groups[gr].enabled = true;
        }
        s
    }

    fn group(gr: usize, seed: u16, tr: bool) -> Drs4Group {
        Drs4Group {
            group: gr,
            start_index: 17 * seed % 1024,
            channels: (0..8)
                .map(|ch| {
                    (0..NS)
                        .map(|s| ((s + 200 * ch + seed as usize) % 4096) as u16)
                        .collect()
                })
                .collect(),
            tr: tr.then(|| (0..NS).map(|s| (4095 - s - seed as usize) as u16).collect()),
        }
    }

    #[test]
    fn test_two_groups_unpacked() {
        let s = settings(&[0, 3], false);
        let mut dec = Drs4Decoder::new("drs0", &s, 4, OverflowPolicy::Fatal);
        let mut words = encode_drs4_event(5, 1000, &[group(0, 1, false), group(3, 2, false)]);
        words.extend(encode_drs4_event(6, 2000, &[group(0, 3, false), group(3, 4, false)]));
        let bytes = to_bytes(&words);
        assert_eq!(dec.decode(&bytes).unwrap(), bytes.len());

        let gr3 = dec.store().get(1).unwrap();
        assert_eq!(gr3.label(), "gr3");
        assert_eq!(gr3.len(), 2);
        for ch in 0..8 {
            assert_eq!(&gr3.trace(ch)[..NS], &group(3, 2, false).channels[ch][..]);
            assert_eq!(&gr3.trace(ch)[NS..], &group(3, 4, false).channels[ch][..]);
        }
        assert_eq!(gr3.timestamps(), &[1000, 2000]);
        assert_eq!(gr3.trigger_counts(), &[5, 6]);
        assert_eq!(gr3.start_index(), &[34, 68]);
        assert_eq!(dec.sequence_stats(), &SequenceStats::default());
    }

    #[test]
    fn test_tr_samples_stored() {
        let s = settings(&[1, 2], true);
        let mut dec = Drs4Decoder::new("drs0", &s, 4, OverflowPolicy::Fatal);
        let words = encode_drs4_event(0, 0, &[group(1, 9, true), group(2, 8, true)]);
        dec.decode(&to_bytes(&words)).unwrap();
        let gr2 = dec.store().get(1).unwrap();
        assert_eq!(gr2.trace(8), &group(2, 8, true).tr.unwrap()[..]);

        let mut sink = MemorySink::new("out");
        dec.write_out(&mut sink, 1).unwrap();
        assert_eq!(sink.dataset("/drs0/gr1/tr_samples").unwrap().shape(), &[1, NS]);
        assert_eq!(
            sink.attr("/drs0/gr2", "tr"),
            Some(&crate::sink::AttrValue::U32(1))
        );
    }

    #[test]
    fn test_unexpected_tr() {
        let s = settings(&[2], false);
        let mut dec = Drs4Decoder::new("drs0", &s, 4, OverflowPolicy::Fatal);
        let words = encode_drs4_event(0, 0, &[group(2, 0, true)]);
        assert_eq!(
            dec.decode(&to_bytes(&words)),
            Err(DecodeError::UnexpectedTr {
                card: "drs0".into(),
                tr: 1,
                group: 2
            })
        );
    }

    #[test]
    fn test_missing_tr() {
        let s = settings(&[0], true);
        let mut dec = Drs4Decoder::new("drs0", &s, 4, OverflowPolicy::Fatal);
        let words = encode_drs4_event(0, 0, &[group(0, 0, false)]);
        assert!(matches!(
            dec.decode(&to_bytes(&words)),
            Err(DecodeError::MissingTr { tr: 0, group: 0, .. })
        ));
    }

    #[test]
    fn test_tr_follows_group_pairs() {
        // Groups 0 and 1 share TR0, groups 2 and 3 share TR1
        for (gr, tr) in [(1, 0), (2, 1), (3, 1)] {
            let s = settings(&[gr], true);
            let mut dec = Drs4Decoder::new("drs0", &s, 4, OverflowPolicy::Fatal);
            let words = encode_drs4_event(0, 0, &[group(gr, 0, false)]);
            assert_eq!(
                dec.decode(&to_bytes(&words)),
                Err(DecodeError::MissingTr {
                    card: "drs0".into(),
                    tr,
                    group: gr
                })
            );
        }
    }

    #[test]
    fn test_disabled_group() {
        let s = settings(&[0], false);
        let mut dec = Drs4Decoder::new("drs0", &s, 4, OverflowPolicy::Fatal);
        let words = encode_drs4_event(0, 0, &[group(0, 0, false), group(1, 0, false)]);
        assert!(matches!(
            dec.decode(&to_bytes(&words)),
            Err(DecodeError::DisabledChannel {
                kind: "group",
                index: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_sample_count_mismatch() {
        let s = V1742Settings {
            num_samples: 2,
            groups: settings(&[0], false).groups,
            ..Default::default()
        };
        let mut dec = Drs4Decoder::new("drs0", &s, 4, OverflowPolicy::Fatal);
        let words = encode_drs4_event(0, 0, &[group(0, 0, false)]);
        assert!(matches!(
            dec.decode(&to_bytes(&words)),
            Err(DecodeError::SampleMismatch {
                received: NS,
                expected: 256,
                ..
            })
        ));
    }

    #[test]
    fn test_event_size_checked() {
        let s = settings(&[0], false);
        let mut dec = Drs4Decoder::new("drs0", &s, 4, OverflowPolicy::Fatal);
        let mut words = encode_drs4_event(0, 0, &[group(0, 0, false)]);
        words[0] += 2;
        words.extend([0, 0]);
        assert!(matches!(
            dec.decode(&to_bytes(&words)),
            Err(DecodeError::FrameSize { frame: "event", .. })
        ));
    }

    #[test]
    fn test_overflow() {
        let s = settings(&[0], false);
        let mut dec = Drs4Decoder::new("drs0", &s, 1, OverflowPolicy::Fatal);
        let mut words = encode_drs4_event(0, 0, &[group(0, 0, false)]);
        words.extend(encode_drs4_event(1, 0, &[group(0, 1, false)]));
        assert!(matches!(
            dec.decode(&to_bytes(&words)),
            Err(DecodeError::Overflow { capacity: 1, .. })
        ));
        assert_eq!(dec.store().get(0).unwrap().trigger_counts(), &[0]);
    }

    #[test]
    fn test_write_out_layout() {
        let s = settings(&[0], false);
        let mut dec = Drs4Decoder::new("drs0", &s, 4, OverflowPolicy::Fatal);
        let mut words = Vec::new();
        for i in 0..3 {
            words.extend(encode_drs4_event(i, 10 * i, &[group(0, i as u16, false)]));
        }
        dec.decode(&to_bytes(&words)).unwrap();
        let mut sink = MemorySink::new("out");
        dec.write_out(&mut sink, 2).unwrap();
        assert_eq!(sink.u32s("/drs0/gr0/trigger_time"), Some(&[0, 10][..]));
        assert_eq!(sink.u32s("/drs0/gr0/trigger_count"), Some(&[0, 1][..]));
        assert_eq!(sink.dataset("/drs0/gr0/ch7/samples").unwrap().shape(), &[2, NS]);
        assert_eq!(
            sink.attr("/drs0/gr0/ch7", "offset"),
            Some(&crate::sink::AttrValue::U32(0x8000))
        );
        assert!(sink.dataset("/drs0/gr0/tr_samples").is_none());
        assert_eq!(dec.store().get(0).unwrap().trigger_counts(), &[2]);
    }
}
