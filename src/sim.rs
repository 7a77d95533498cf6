//! Simulated digitizers and frame encoders
//!
//! The encoders build byte-exact board aggregates for both models. The simulated
//! card wraps them behind [`Digitizer`] so the whole pipeline can run without a
//! VME crate attached.

use std::time::Instant;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, warn};

use crate::{
    decoder::{unpack::pack_psd, unpack::pack_triplet, AGGREGATE_TAG},
    digitizer::Digitizer,
    error::HardwareError,
    settings::{DigitizerSettings, V1730Settings, V1742Settings, V1742_GROUP_CHANNELS},
};

pub fn to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// One DPP-PSD event as the firmware would report it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PsdEvent {
    pub channel: usize,
    pub timestamp: u32,
    /// Must be a multiple of 8 long
    pub samples: Vec<u16>,
    pub baseline: u16,
    pub charge_short: u16,
    pub charge_long: u16,
}

// Charge, time tag, baseline and waveform enabled
const PSD_FORMAT_FLAGS: u32 = 0x7800_0000;

/// Encode one V1730 board aggregate. Events are grouped into channel pair
/// aggregates; every event of a pair must carry the same sample count.
pub fn encode_psd_aggregate(counter: u32, time_tag: u32, events: &[PsdEvent]) -> Vec<u32> {
    let mut body = Vec::new();
    let mut mask = 0u32;
    for pair in 0..8 {
        let pair_events: Vec<&PsdEvent> = events.iter().filter(|e| e.channel / 2 == pair).collect();
        let Some(first) = pair_events.first() else {
            continue;
        };
        mask |= 1 << pair;
        let samples = first.samples.len();
        let size = 2 + pair_events.len() * (samples / 2 + 3);
        body.push(0x8000_0000 | size as u32);
        body.push(PSD_FORMAT_FLAGS | (samples / 8) as u32);
        for e in pair_events {
            let odd = if e.channel % 2 == 1 { 0x8000_0000 } else { 0 };
            body.push(odd | (e.timestamp & 0x7FFF_FFFF));
            body.extend(e.samples.chunks(2).map(|p| pack_psd(p[0], p.get(1).copied().unwrap_or(0))));
            body.push(e.baseline as u32);
            body.push((e.charge_short as u32 & 0x7FFF) | ((e.charge_long as u32) << 16));
        }
    }
    let mut words = vec![
        AGGREGATE_TAG | (4 + body.len()) as u32,
        mask,
        counter & 0x7F_FFFF,
        time_tag,
    ];
    words.extend(body);
    words
}

/// One DRS4 group within an event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drs4Group {
    pub group: usize,
    pub start_index: u16,
    /// Eight channels of equal length
    pub channels: Vec<Vec<u16>>,
    pub tr: Option<Vec<u16>>,
}

/// Encode one V1742 event. Groups are written in ascending order.
pub fn encode_drs4_event(counter: u32, time_tag: u32, groups: &[Drs4Group]) -> Vec<u32> {
    let mut ordered: Vec<&Drs4Group> = groups.iter().collect();
    ordered.sort_by_key(|g| g.group);
    let mut body = Vec::new();
    let mut mask = 0u32;
    for g in ordered {
        mask |= 1 << g.group;
        let ns = g.channels.first().map_or(0, Vec::len);
        let tr = u32::from(g.tr.is_some());
        body.push(((g.start_index as u32 & 0x3FF) << 20) | (tr << 12) | (3 * ns) as u32);
        for s in 0..ns {
            let column: [u16; 8] = std::array::from_fn(|ch| g.channels[ch][s]);
            body.extend(pack_triplet(column));
        }
        if let Some(tr) = &g.tr {
            for chunk in tr.chunks(8) {
                let mut eight = [0u16; 8];
                eight[..chunk.len()].copy_from_slice(chunk);
                body.extend(pack_triplet(eight));
            }
        }
        body.push(time_tag);
    }
    let mut words = vec![
        AGGREGATE_TAG | (4 + body.len()) as u32,
        mask,
        counter & 0x3F_FFFF,
        time_tag,
    ];
    words.extend(body);
    words
}

// Ticks of the 250 MHz time tag between simulated triggers
const TICKS_PER_TRIGGER: u32 = 2500;
const BASE_TEMPERATURE: u32 = 38;

/// A card that fabricates pulses instead of reading a VME crate
pub struct SimulatedDigitizer {
    index: String,
    rng: StdRng,
    applied: Option<DigitizerSettings>,
    acquiring: bool,
    pending: Vec<u8>,
    counter: u32,
    time_tag: u32,
    generated: u64,
    forced: u64,
    rate: Option<f64>,
    started: Instant,
    halt_after: Option<u64>,
    overheat: Option<(u64, u32)>,
    stop_after: Option<u64>,
}

impl SimulatedDigitizer {
    pub fn new(index: &str, seed: u64) -> Self {
        Self {
            index: index.to_owned(),
            rng: StdRng::seed_from_u64(seed),
            applied: None,
            acquiring: false,
            pending: Vec::new(),
            counter: 0,
            time_tag: 0,
            generated: 0,
            forced: 0,
            rate: None,
            started: Instant::now(),
            halt_after: None,
            overheat: None,
            stop_after: None,
        }
    }

    /// Limit trigger generation to `hz` aggregates per second; unlimited otherwise.
    pub fn with_rate(mut self, hz: f64) -> Self {
        self.rate = Some(hz);
        self
    }

    /// Stop acquiring on our own after `n` aggregates, as a failing card would.
    pub fn halt_after(mut self, n: u64) -> Self {
        self.halt_after = Some(n);
        self
    }

    /// Report `temp` on every channel once `n` aggregates were produced.
    pub fn overheat_after(mut self, n: u64, temp: u32) -> Self {
        self.overheat = Some((n, temp));
        self
    }

    /// Produce exactly `n` aggregates and then go quiet while still acquiring.
    pub fn stop_generating_after(mut self, n: u64) -> Self {
        self.stop_after = Some(n);
        self
    }

    pub fn applied(&self) -> Option<&DigitizerSettings> {
        self.applied.as_ref()
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }

    fn due(&self) -> u64 {
        let mut due = match self.rate {
            Some(hz) => (self.started.elapsed().as_secs_f64() * hz) as u64 + self.forced,
            None => self.generated + 1,
        };
        for limit in [self.halt_after, self.stop_after].into_iter().flatten() {
            due = due.min(limit);
        }
        due
    }

    fn generate(&mut self) {
        let Some(settings) = self.applied.clone() else {
            return;
        };
        let due = self.due();
        while self.generated < due {
            self.counter = self.counter.wrapping_add(1);
            self.time_tag = self.time_tag.wrapping_add(TICKS_PER_TRIGGER);
            let words = match &settings {
                DigitizerSettings::V1730(s) => {
                    let events = self.psd_events(s);
                    encode_psd_aggregate(self.counter, self.time_tag, &events)
                }
                DigitizerSettings::V1742(s) => {
                    let groups = self.drs4_groups(s);
                    encode_drs4_event(self.counter, self.time_tag, &groups)
                }
            };
            self.pending.extend(to_bytes(&words));
            self.generated += 1;
        }
        if self.halt_after.map_or(false, |n| self.generated >= n) && self.acquiring {
            warn!(card = self.index.as_str(), "Simulated acquisition halt");
            self.acquiring = false;
        }
    }

    fn pulse(&mut self, n: usize, baseline: f64, start: usize, max: u16) -> Vec<u16> {
        let amplitude = self.rng.gen_range(50.0..2000.0);
        let tau = self.rng.gen_range(5.0..40.0);
        (0..n)
            .map(|s| {
                let noise: f64 = self.rng.gen_range(-3.0..3.0);
                let signal = if s >= start {
                    amplitude * (-((s - start) as f64) / tau).exp()
                } else {
                    0.0
                };
                (baseline - signal + noise).clamp(0.0, max as f64) as u16
            })
            .collect()
    }

    fn psd_events(&mut self, s: &V1730Settings) -> Vec<PsdEvent> {
        let time_tag = self.time_tag;
        s.enabled_channels()
            .map(|ch| {
                let c = &s.channels[ch];
                let n = c.record_length as usize;
                let samples = self.pulse(n, 8000.0, (c.pre_trigger as usize).min(n), 0x3FFF);
                let integral = |len: u32| -> u16 {
                    let start = (c.pre_trigger.saturating_sub(c.gate_offset)) as usize;
                    samples
                        .iter()
                        .skip(start)
                        .take(len as usize)
                        .map(|v| 8000u32.saturating_sub(*v as u32))
                        .sum::<u32>()
                        .min(0x7FFF) as u16
                };
                PsdEvent {
                    channel: ch,
                    timestamp: time_tag & 0x7FFF_FFFF,
                    baseline: 8000,
                    charge_short: integral(c.short_gate),
                    charge_long: integral(c.long_gate),
                    samples,
                }
            })
            .collect()
    }

    fn drs4_groups(&mut self, s: &V1742Settings) -> Vec<Drs4Group> {
        let n = s.samples_per_event();
        s.enabled_groups()
            .map(|gr| Drs4Group {
                group: gr,
                start_index: self.rng.gen_range(0..1024),
                channels: (0..V1742_GROUP_CHANNELS)
                    .map(|_| self.pulse(n, 2048.0, n / 4, 0xFFF))
                    .collect(),
                tr: s.tr_readout.then(|| self.pulse(n, 3000.0, n / 4 - 4, 0xFFF)),
            })
            .collect()
    }
}

impl Digitizer for SimulatedDigitizer {
    fn index(&self) -> &str {
        &self.index
    }

    fn program(&mut self, settings: &DigitizerSettings) -> Result<DigitizerSettings, HardwareError> {
        let mut applied = settings.clone();
        if let DigitizerSettings::V1730(s) = &mut applied {
            // Record length is programmed in units of 8 samples
            for c in s.channels.iter_mut() {
                c.record_length = c.record_length.div_ceil(8) * 8;
            }
            s.sync_pairs();
        }
        debug!(card = self.index.as_str(), "Programmed simulated card");
        self.applied = Some(applied.clone());
        Ok(applied)
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        if self.applied.is_none() {
            return Err(HardwareError::Other {
                card: self.index.clone(),
                message: "started before programming".to_owned(),
            });
        }
        self.acquiring = true;
        self.started = Instant::now();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HardwareError> {
        self.acquiring = false;
        Ok(())
    }

    fn software_trigger(&mut self) -> Result<(), HardwareError> {
        if !self.acquiring {
            return Err(HardwareError::Other {
                card: self.index.clone(),
                message: "software trigger while not acquiring".to_owned(),
            });
        }
        self.forced += 1;
        self.generate();
        Ok(())
    }

    fn ready_for_readout(&mut self) -> Result<bool, HardwareError> {
        if self.acquiring {
            self.generate();
        }
        Ok(!self.pending.is_empty())
    }

    fn block_transfer(&mut self, dst: &mut [u8]) -> Result<usize, HardwareError> {
        let n = dst.len().min(self.pending.len());
        dst[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn is_acquiring(&mut self) -> Result<bool, HardwareError> {
        Ok(self.acquiring)
    }

    fn read_temperatures(&mut self) -> Result<Vec<u32>, HardwareError> {
        let channels = match &self.applied {
            Some(DigitizerSettings::V1742(_)) => 4,
            _ => 16,
        };
        let temp = match self.overheat {
            Some((n, hot)) if self.generated >= n => hot,
            _ => BASE_TEMPERATURE,
        };
        Ok(vec![temp; channels])
    }
}
