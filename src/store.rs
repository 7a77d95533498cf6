//! Preallocated per-channel event records
//!
//! Each enabled channel (or DRS4 group) owns one [`ChannelRecords`]: a struct of
//! arrays indexed by event number. Everything is allocated up front from the
//! finalized settings, appended to by the decoder, and shifted down after a flush
//! consumed a prefix.

use std::ops::Range;

/// Which per-event metadata columns a record set carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Columns {
    pub timestamp: bool,
    pub trigger_count: bool,
    pub baseline: bool,
    pub charge: bool,
    pub start_index: bool,
}

impl Columns {
    /// DPP-PSD channels: time tag, baseline and both charge integrals
    pub const PSD: Columns = Columns {
        timestamp: true,
        trigger_count: false,
        baseline: true,
        charge: true,
        start_index: false,
    };

    /// DRS4 groups: trigger time tag, event counter and the start cell
    pub const DRS4: Columns = Columns {
        timestamp: true,
        trigger_count: true,
        baseline: false,
        charge: false,
        start_index: true,
    };
}

/// Shape of one channel's record set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordLayout {
    /// Name used in logs and output paths (`ch3`, `gr1`)
    pub label: String,
    pub n_samples: usize,
    /// Waveforms stored per event: 1 for a PSD channel, 8 (or 9 with TR) for a DRS4 group
    pub traces: usize,
    /// Hard ceiling on stored events. Zero stores nothing and only counts.
    pub capacity: usize,
    pub columns: Columns,
}

/// Metadata of a single event. Fields whose column is disabled are ignored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventMeta {
    pub timestamp: u32,
    pub trigger_count: u32,
    pub baseline: u16,
    pub charge_short: u16,
    pub charge_long: u16,
    pub start_index: u16,
}

fn column<T: Clone + Default>(enabled: bool, capacity: usize) -> Vec<T> {
    if enabled {
        vec![T::default(); capacity]
    } else {
        Vec::new()
    }
}

/// Struct of arrays for one channel.
#[derive(Clone, Debug)]
pub struct ChannelRecords {
    layout: RecordLayout,
    len: usize,
    grabbed: u64,
    dropped: u64,
    // [trace][event * n_samples + sample]
    traces: Vec<Vec<u16>>,
    timestamps: Vec<u32>,
    trigger_counts: Vec<u32>,
    baselines: Vec<u16>,
    charge_short: Vec<u16>,
    charge_long: Vec<u16>,
    start_index: Vec<u16>,
}

impl ChannelRecords {
    pub fn new(layout: RecordLayout) -> Self {
        let cap = layout.capacity;
        let c = layout.columns;
        Self {
            traces: vec![vec![0u16; cap * layout.n_samples]; layout.traces],
            timestamps: column(c.timestamp, cap),
            trigger_counts: column(c.trigger_count, cap),
            baselines: column(c.baseline, cap),
            charge_short: column(c.charge, cap),
            charge_long: column(c.charge, cap),
            start_index: column(c.start_index, cap),
            layout,
            len: 0,
            grabbed: 0,
            dropped: 0,
        }
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn label(&self) -> &str {
        &self.layout.label
    }

    pub fn n_samples(&self) -> usize {
        self.layout.n_samples
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    /// Stored events waiting for a flush
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.layout.capacity
    }

    /// Every event seen for this channel, stored or not
    pub fn grabbed(&self) -> u64 {
        self.grabbed
    }

    /// Events counted without being stored
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Claim the next event slot, or `None` when the store is at capacity.
    pub fn push(&mut self) -> Option<EventSlot<'_>> {
        if self.is_full() {
            return None;
        }
        let index = self.len;
        self.len += 1;
        self.grabbed += 1;
        Some(EventSlot {
            records: self,
            index,
        })
    }

    /// Count an event that did not fit.
    pub fn count_dropped(&mut self) {
        self.grabbed += 1;
        self.dropped += 1;
    }

    fn samples_of(&self, events: Range<usize>) -> Range<usize> {
        events.start * self.layout.n_samples..events.end * self.layout.n_samples
    }

    /// Stored samples of trace `t`, `len() * n_samples()` values
    pub fn trace(&self, t: usize) -> &[u16] {
        &self.traces[t][self.samples_of(0..self.len)]
    }

    pub fn timestamps(&self) -> &[u32] {
        self.stored(&self.timestamps)
    }

    pub fn trigger_counts(&self) -> &[u32] {
        self.stored(&self.trigger_counts)
    }

    pub fn baselines(&self) -> &[u16] {
        self.stored(&self.baselines)
    }

    pub fn charge_short(&self) -> &[u16] {
        self.stored(&self.charge_short)
    }

    pub fn charge_long(&self) -> &[u16] {
        self.stored(&self.charge_long)
    }

    pub fn start_index(&self) -> &[u16] {
        self.stored(&self.start_index)
    }

    fn stored<'a, T>(&self, col: &'a [T]) -> &'a [T] {
        if col.is_empty() {
            col
        } else {
            &col[..self.len]
        }
    }

    /// Discard the first `n` stored events, moving the rest to the front.
    ///
    /// # Panics
    /// If `n` exceeds the stored count.
    pub fn drain(&mut self, n: usize) {
        assert!(n <= self.len, "drain of {n} events from {}", self.len);
        let ns = self.layout.n_samples;
        let keep = self.len * ns;
        for trace in &mut self.traces {
            trace.copy_within(n * ns..keep, 0);
        }
        let len = self.len;
        for col in [&mut self.timestamps, &mut self.trigger_counts] {
            if !col.is_empty() {
                col.copy_within(n..len, 0);
            }
        }
        for col in [
            &mut self.baselines,
            &mut self.charge_short,
            &mut self.charge_long,
            &mut self.start_index,
        ] {
            if !col.is_empty() {
                col.copy_within(n..len, 0);
            }
        }
        self.len -= n;
    }
}

/// Write access to one freshly claimed event.
pub struct EventSlot<'a> {
    records: &'a mut ChannelRecords,
    index: usize,
}

impl<'a> EventSlot<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn trace_mut(&mut self, t: usize) -> &mut [u16] {
        let range = self.records.samples_of(self.index..self.index + 1);
        &mut self.records.traces[t][range]
    }

    /// All trace slots of this event at once
    pub fn traces_mut(&mut self) -> Vec<&mut [u16]> {
        let range = self.records.samples_of(self.index..self.index + 1);
        self.records
            .traces
            .iter_mut()
            .map(|t| &mut t[range.clone()])
            .collect()
    }

    pub fn set_meta(&mut self, meta: EventMeta) {
        let i = self.index;
        let r = &mut *self.records;
        if let Some(v) = r.timestamps.get_mut(i) {
            *v = meta.timestamp;
        }
        if let Some(v) = r.trigger_counts.get_mut(i) {
            *v = meta.trigger_count;
        }
        if let Some(v) = r.baselines.get_mut(i) {
            *v = meta.baseline;
        }
        if let Some(v) = r.charge_short.get_mut(i) {
            *v = meta.charge_short;
        }
        if let Some(v) = r.charge_long.get_mut(i) {
            *v = meta.charge_long;
        }
        if let Some(v) = r.start_index.get_mut(i) {
            *v = meta.start_index;
        }
    }
}

/// All channels of one card.
#[derive(Clone, Debug, Default)]
pub struct RecordStore {
    channels: Vec<ChannelRecords>,
}

impl RecordStore {
    pub fn new(layouts: impl IntoIterator<Item = RecordLayout>) -> Self {
        Self {
            channels: layouts.into_iter().map(ChannelRecords::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&ChannelRecords> {
        self.channels.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ChannelRecords> {
        self.channels.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelRecords> {
        self.channels.iter()
    }

    /// Events that every channel can supply
    pub fn events_ready(&self) -> usize {
        self.channels.iter().map(|c| c.len()).min().unwrap_or(0)
    }

    pub fn drain(&mut self, n: usize) {
        for c in &mut self.channels {
            c.drain(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(label: &str, n_samples: usize, capacity: usize) -> RecordLayout {
        RecordLayout {
            label: label.to_owned(),
            n_samples,
            traces: 1,
            capacity,
            columns: Columns::PSD,
        }
    }

    fn push_event(r: &mut ChannelRecords, tag: u16) -> bool {
        let Some(mut slot) = r.push() else {
            return false;
        };
        slot.trace_mut(0).iter_mut().for_each(|s| *s = tag);
        slot.set_meta(EventMeta {
            timestamp: tag as u32 * 10,
            baseline: tag,
            charge_short: tag + 1,
            charge_long: tag + 2,
            ..Default::default()
        });
        true
    }

    #[test]
    fn test_push_until_full() {
        let mut r = ChannelRecords::new(layout("ch0", 4, 3));
        for tag in 0..3 {
            assert!(push_event(&mut r, tag));
        }
        assert!(r.is_full());
        assert!(!push_event(&mut r, 9));
        r.count_dropped();
        assert_eq!(r.len(), 3);
        assert_eq!(r.grabbed(), 4);
        assert_eq!(r.dropped(), 1);
        assert_eq!(r.trace(0), &[0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(r.timestamps(), &[0, 10, 20]);
        assert_eq!(r.charge_long(), &[2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_only_counts() {
        let mut r = ChannelRecords::new(layout("ch0", 8, 0));
        assert!(r.push().is_none());
        assert!(r.trace(0).is_empty());
        assert!(r.timestamps().is_empty());
    }

    #[test]
    fn test_disabled_columns_are_empty() {
        let mut r = ChannelRecords::new(layout("ch0", 2, 2));
        push_event(&mut r, 1);
        assert!(r.trigger_counts().is_empty());
        assert!(r.start_index().is_empty());
        assert_eq!(r.baselines(), &[1]);
    }

    #[test]
    fn test_drain_keeps_surplus_in_order() {
        let mut r = ChannelRecords::new(layout("ch0", 3, 5));
        for tag in 0..5 {
            push_event(&mut r, tag);
        }
        r.drain(3);
        assert_eq!(r.len(), 2);
        assert_eq!(r.trace(0), &[3, 3, 3, 4, 4, 4]);
        assert_eq!(r.timestamps(), &[30, 40]);
        assert_eq!(r.baselines(), &[3, 4]);
        assert_eq!(r.charge_short(), &[4, 5]);
        // Freed slots are reusable
        push_event(&mut r, 7);
        assert_eq!(r.timestamps(), &[30, 40, 70]);
        assert_eq!(r.grabbed(), 6);
    }

    #[test]
    fn test_multi_trace_layout() {
        let mut r = ChannelRecords::new(RecordLayout {
            label: "gr0".to_owned(),
            n_samples: 2,
            traces: 8,
            capacity: 2,
            columns: Columns::DRS4,
        });
        let mut slot = r.push().unwrap();
        for (t, trace) in slot.traces_mut().into_iter().enumerate() {
            trace.copy_from_slice(&[t as u16, 100 + t as u16]);
        }
        slot.set_meta(EventMeta {
            timestamp: 5,
            trigger_count: 6,
            start_index: 7,
            ..Default::default()
        });
        assert_eq!(r.trace(7), &[7, 107]);
        assert_eq!(r.trigger_counts(), &[6]);
        assert_eq!(r.start_index(), &[7]);
        assert!(r.baselines().is_empty());
    }

    #[test]
    fn test_flush_consistency() {
        let mut store = RecordStore::new([layout("ch0", 1, 10), layout("ch1", 1, 10)]);
        for tag in 0..7 {
            push_event(store.get_mut(0).unwrap(), tag);
        }
        for tag in 0..4 {
            push_event(store.get_mut(1).unwrap(), tag);
        }
        assert_eq!(store.events_ready(), 4);
        let before: Vec<usize> = store.iter().map(|c| c.len()).collect();
        store.drain(3);
        let after: Vec<usize> = store.iter().map(|c| c.len()).collect();
        assert_eq!(after, vec![before[0] - 3, before[1] - 3]);
        assert_eq!(store.events_ready(), 1);
    }

    #[test]
    #[should_panic]
    fn test_drain_past_len_panics() {
        let mut r = ChannelRecords::new(layout("ch0", 1, 2));
        push_event(&mut r, 0);
        r.drain(2);
    }
}
