//! When to flush and when a run is over
//!
//! Policies only decide. The decode loop asks them after every pass and does the
//! writing itself.

use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub enum RunCyclePolicy {
    /// Flush once every card holds `events`; run `repeat` cycles (0 means one file)
    EventCount {
        base: String,
        events: usize,
        repeat: usize,
        cycle: usize,
    },
    /// Run for `runtime`, starting a new file every `events_per_file` events
    Timed {
        base: String,
        runtime: Duration,
        events_per_file: usize,
        deadline: Option<Instant>,
        cycle: usize,
    },
}

impl RunCyclePolicy {
    pub fn event_count(base: &str, events: usize, repeat: usize) -> Self {
        Self::EventCount {
            base: base.to_owned(),
            events,
            repeat,
            cycle: 0,
        }
    }

    pub fn timed(base: &str, runtime: Duration, events_per_file: usize) -> Self {
        Self::Timed {
            base: base.to_owned(),
            runtime,
            events_per_file,
            deadline: None,
            cycle: 0,
        }
    }

    /// Start the clock for time-bounded runs.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        if let Self::Timed {
            runtime, deadline, ..
        } = self
        {
            *deadline = Some(now + *runtime);
        }
    }

    pub fn cycle(&self) -> usize {
        match self {
            Self::EventCount { cycle, .. } | Self::Timed { cycle, .. } => *cycle,
        }
    }

    fn expired(deadline: &Option<Instant>) -> bool {
        deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// `ready` holds one ready-event count per card.
    pub fn should_flush(&self, ready: &[usize]) -> bool {
        if ready.is_empty() {
            return false;
        }
        match self {
            Self::EventCount { events, .. } => *events > 0 && ready.iter().all(|r| r >= events),
            Self::Timed {
                events_per_file,
                deadline,
                ..
            } => {
                Self::expired(deadline)
                    || (*events_per_file > 0 && ready.iter().all(|r| r >= events_per_file))
            }
        }
    }

    /// Events to take from every channel of every card in this flush
    pub fn flush_count(&self, ready: &[usize]) -> usize {
        let least = ready.iter().copied().min().unwrap_or(0);
        match self {
            Self::EventCount { events, .. } => *events,
            Self::Timed {
                events_per_file, ..
            } => least.min(*events_per_file),
        }
    }

    /// Output name for the current cycle, without extension
    pub fn file_name(&self) -> String {
        match self {
            Self::EventCount {
                base,
                repeat,
                cycle,
                ..
            } => {
                if *repeat > 0 {
                    format!("{base}.{cycle}")
                } else {
                    base.clone()
                }
            }
            Self::Timed { base, cycle, .. } => format!("{base}.{cycle}"),
        }
    }

    /// Advance past a completed flush. Returns whether the run continues.
    pub fn on_flushed(&mut self) -> bool {
        match self {
            Self::EventCount { repeat, cycle, .. } => {
                if *repeat == 0 || *cycle + 1 >= *repeat {
                    return false;
                }
                *cycle += 1;
                true
            }
            Self::Timed {
                deadline, cycle, ..
            } => {
                if Self::expired(deadline) {
                    return false;
                }
                *cycle += 1;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_count_waits_for_every_card() {
        let p = RunCyclePolicy::event_count("data", 100, 0);
        assert!(!p.should_flush(&[100, 99]));
        assert!(p.should_flush(&[100, 150]));
        assert_eq!(p.flush_count(&[100, 150]), 100);
        assert!(!p.should_flush(&[]));
    }

    #[test]
    fn test_single_file_run() {
        let mut p = RunCyclePolicy::event_count("data", 10, 0);
        assert_eq!(p.file_name(), "data");
        assert!(!p.on_flushed());
    }

    #[test]
    fn test_repeat_cycles() {
        let mut p = RunCyclePolicy::event_count("data", 10, 3);
        let mut names = vec![p.file_name()];
        while p.on_flushed() {
            names.push(p.file_name());
        }
        assert_eq!(names, ["data.0", "data.1", "data.2"]);
    }

    #[test]
    fn test_zero_events_never_flushes() {
        let p = RunCyclePolicy::event_count("data", 0, 0);
        assert!(!p.should_flush(&[1_000_000]));
    }

    #[test]
    fn test_timed_splits_files() {
        let mut p = RunCyclePolicy::timed("data", Duration::from_secs(3600), 50);
        p.start();
        assert!(!p.should_flush(&[49, 80]));
        assert!(p.should_flush(&[50, 80]));
        assert_eq!(p.flush_count(&[50, 80]), 50);
        assert_eq!(p.file_name(), "data.0");
        assert!(p.on_flushed());
        assert_eq!(p.file_name(), "data.1");
    }

    #[test]
    fn test_timed_final_flush() {
        let mut p = RunCyclePolicy::timed("data", Duration::from_secs(10), 50);
        p.start_at(Instant::now() - Duration::from_secs(11));
        assert!(p.should_flush(&[7, 12]));
        assert_eq!(p.flush_count(&[7, 12]), 7);
        assert!(!p.on_flushed());
    }

    #[test]
    fn test_timed_without_start_never_expires() {
        let p = RunCyclePolicy::timed("data", Duration::ZERO, 50);
        assert!(!p.should_flush(&[3]));
    }
}
