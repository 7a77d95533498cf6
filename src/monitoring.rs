//! Run monitoring
//!
//! Both loops publish what they see as [`RunEvent`]s on a bounded channel. Sends
//! never block: if nobody keeps up with the channel, events are dropped rather
//! than stalling acquisition. A [`RunSummary`] comes back when the run stops.

use crossbeam_channel::Sender;

use crate::{
    decoder::{sequence::SequenceStats, ChannelRate},
    orchestrator::RunState,
};

/// Why a run stopped taking new data
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainReason {
    /// A card stopped acquiring on its own
    AcquisitionHalted { card: String },
    OverTemperature {
        card: String,
        channel: usize,
        temp: u32,
    },
    /// Stop requested from outside (Ctrl-C)
    Interrupted,
    /// The cycle policy has written its last file
    RunComplete,
    /// A fatal error in either loop
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunEvent {
    State(RunState),
    Temperatures {
        card: String,
        temps: Vec<u32>,
    },
    Decoded {
        card: String,
        bytes: usize,
        fill_pct: f64,
        rates: Vec<ChannelRate>,
    },
    Flushed {
        file: String,
        cycle: usize,
        events: usize,
    },
    Draining(DrainReason),
}

/// Optional event publisher shared by both loops
#[derive(Clone, Debug, Default)]
pub struct Monitor {
    sender: Option<Sender<RunEvent>>,
}

impl Monitor {
    pub fn new(sender: Sender<RunEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn publish(&self, event: RunEvent) {
        if let Some(tx) = &self.sender {
            // We don't care if this errors
            let _ = tx.try_send(event);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CardSummary {
    pub card: String,
    pub bytes_read: u64,
    pub compactions: u64,
    /// Events seen per channel, stored or not
    pub grabbed: Vec<(String, u64)>,
    pub dropped: u64,
    pub sequence: SequenceStats,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    /// Output names, without extension, in write order
    pub files: Vec<String>,
    pub cards: Vec<CardSummary>,
    pub drain_reason: Option<DrainReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_publish_never_blocks() {
        let (tx, rx) = bounded(1);
        let monitor = Monitor::new(tx);
        monitor.publish(RunEvent::State(RunState::Running));
        monitor.publish(RunEvent::State(RunState::Draining));
        assert_eq!(rx.try_recv(), Ok(RunEvent::State(RunState::Running)));
        assert!(rx.try_recv().is_err());
        Monitor::default().publish(RunEvent::Draining(DrainReason::Interrupted));
    }
}
