//! Trigger counter bookkeeping
//!
//! Counters coming out of the hardware should step by one. Anything else is worth
//! a log line but never stops the run.

/// How an observed counter relates to the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sequence {
    First,
    Next,
    Duplicate,
    /// Counter went backwards
    Orphaned,
    /// Counter skipped ahead by this many
    Missed(u32),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceStats {
    pub duplicates: u64,
    pub orphans: u64,
    pub missed: u64,
}

/// Tracks one counter stream that wraps at `mask`.
#[derive(Clone, Debug)]
pub struct TriggerSequence {
    mask: u32,
    last: Option<u32>,
    stats: SequenceStats,
}

impl TriggerSequence {
    pub fn new(mask: u32) -> Self {
        Self {
            mask,
            last: None,
            stats: SequenceStats::default(),
        }
    }

    pub fn stats(&self) -> &SequenceStats {
        &self.stats
    }

    pub fn observe(&mut self, count: u32) -> Sequence {
        let count = count & self.mask;
        let Some(last) = self.last else {
            self.last = Some(count);
            return Sequence::First;
        };
        let expected = last.wrapping_add(1) & self.mask;
        if count == expected {
            self.last = Some(count);
            Sequence::Next
        } else if count == last {
            self.stats.duplicates += 1;
            Sequence::Duplicate
        } else if count < last {
            self.stats.orphans += 1;
            Sequence::Orphaned
        } else {
            let skipped = count.wrapping_sub(expected) & self.mask;
            self.stats.missed += skipped as u64;
            self.last = Some(count);
            Sequence::Missed(skipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order() {
        let mut seq = TriggerSequence::new(0x3F_FFFF);
        assert_eq!(seq.observe(10), Sequence::First);
        assert_eq!(seq.observe(11), Sequence::Next);
        assert_eq!(seq.observe(12), Sequence::Next);
        assert_eq!(seq.stats(), &SequenceStats::default());
    }

    #[test]
    fn test_duplicate_and_orphan_keep_last() {
        let mut seq = TriggerSequence::new(0xFF);
        seq.observe(5);
        assert_eq!(seq.observe(5), Sequence::Duplicate);
        assert_eq!(seq.observe(3), Sequence::Orphaned);
        assert_eq!(seq.observe(6), Sequence::Next);
        assert_eq!(seq.stats().duplicates, 1);
        assert_eq!(seq.stats().orphans, 1);
    }

    #[test]
    fn test_missed_advances() {
        let mut seq = TriggerSequence::new(0xFF);
        seq.observe(1);
        assert_eq!(seq.observe(5), Sequence::Missed(3));
        assert_eq!(seq.observe(6), Sequence::Next);
        assert_eq!(seq.stats().missed, 3);
    }

    #[test]
    fn test_wraps_at_mask() {
        let mut seq = TriggerSequence::new(0xFF);
        seq.observe(0xFE);
        assert_eq!(seq.observe(0xFF), Sequence::Next);
        assert_eq!(seq.observe(0x00), Sequence::Next);
        // A skip across the wrap is indistinguishable from a jump back
        let mut seq = TriggerSequence::new(0xFF);
        seq.observe(0xFD);
        assert_eq!(seq.observe(0x01), Sequence::Orphaned);
    }
}
