//! Register-level digitizer settings and their validation
//!
//! Settings are deserialized from the run database, validated, handed to the
//! hardware layer for programming, and then frozen. The hardware layer returns the
//! settings it actually applied (see [`crate::digitizer::Digitizer::program`]) and
//! the decoder is built from that finalized copy.

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

pub const V1730_CHANNELS: usize = 16;
pub const V1742_GROUPS: usize = 4;
pub const V1742_GROUP_CHANNELS: usize = 8;

/// Card-wide V1730 DPP-PSD configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct V1730Card {
    pub dual_trace: bool,
    pub analog_probe: u32,
    pub oscilloscope_mode: bool,
    pub digital_virt_probe_1: u32,
    pub digital_virt_probe_2: u32,
    pub coincidence_window: u32,
    pub global_majority_level: u32,
    pub external_trigger_enable: bool,
    pub software_trigger_enable: bool,
    pub trig_out_logic: u32,
    pub trig_out_majority_level: u32,
    pub external_trigger_out: bool,
    pub software_trigger_out: bool,
    /// Board aggregates moved per block transfer
    pub aggregates_per_transfer: u32,
}

impl Default for V1730Card {
    fn default() -> Self {
        Self {
            dual_trace: false,
            analog_probe: 0,
            oscilloscope_mode: true,
            digital_virt_probe_1: 0,
            digital_virt_probe_2: 0,
            coincidence_window: 1,
            global_majority_level: 0,
            external_trigger_enable: false,
            software_trigger_enable: false,
            trig_out_logic: 0,
            trig_out_majority_level: 0,
            external_trigger_out: false,
            software_trigger_out: false,
            aggregates_per_transfer: 5,
        }
    }
}

/// Per-channel V1730 DPP-PSD configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct V1730Channel {
    pub enabled: bool,
    pub request_global_trigger: bool,
    pub request_trig_out: bool,
    pub record_length: u32,
    pub dynamic_range: u32,
    pub events_per_buffer: u32,
    pub pre_trigger: u32,
    pub long_gate: u32,
    pub short_gate: u32,
    pub gate_offset: u32,
    pub trigger_threshold: u32,
    pub fixed_baseline: u32,
    pub shaped_trigger_width: u32,
    pub trigger_holdoff: u32,
    pub charge_sensitivity: u32,
    /// 0 positive, 1 negative
    pub pulse_polarity: u32,
    pub trigger_type: u32,
    /// fixed, 16, 64, 256, 1024
    pub baseline_average: u32,
    pub self_trigger: bool,
    /// 16 bit DAC spanning -1 V to 1 V
    pub dc_offset: u32,
}

impl Default for V1730Channel {
    fn default() -> Self {
        Self {
            enabled: false,
            request_global_trigger: false,
            request_trig_out: false,
            record_length: 200,
            dynamic_range: 0,
            events_per_buffer: 50,
            pre_trigger: 30,
            long_gate: 20,
            short_gate: 10,
            gate_offset: 5,
            trigger_threshold: 100,
            fixed_baseline: 0,
            shaped_trigger_width: 10,
            trigger_holdoff: 30,
            charge_sensitivity: 0,
            pulse_polarity: 1,
            trigger_type: 0,
            baseline_average: 3,
            self_trigger: false,
            dc_offset: 0x8000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct V1730Settings {
    #[serde(flatten)]
    pub card: V1730Card,
    /// Channels in order; missing trailing channels take the defaults (disabled)
    #[serde(default)]
    pub channels: Vec<V1730Channel>,
}

impl Default for V1730Settings {
    fn default() -> Self {
        Self {
            card: V1730Card::default(),
            channels: vec![V1730Channel::default(); V1730_CHANNELS],
        }
    }
}

fn check_max(
    card: &str,
    channel: usize,
    field: &'static str,
    value: u32,
    max: u32,
) -> Result<(), SettingsError> {
    if value > max {
        return Err(SettingsError::ChannelRange {
            card: card.to_owned(),
            field,
            max,
            channel,
        });
    }
    Ok(())
}

impl V1730Settings {
    /// Pad the channel list out to the sixteen hardware channels.
    pub fn normalize(&mut self, card: &str) -> Result<(), SettingsError> {
        if self.channels.len() > V1730_CHANNELS {
            return Err(SettingsError::Count {
                card: card.to_owned(),
                what: "channels",
                expected: V1730_CHANNELS,
                found: self.channels.len(),
            });
        }
        self.channels.resize(V1730_CHANNELS, V1730Channel::default());
        Ok(())
    }

    pub fn validate(&self, card: &str) -> Result<(), SettingsError> {
        if self.channels.len() != V1730_CHANNELS {
            return Err(SettingsError::Count {
                card: card.to_owned(),
                what: "channels",
                expected: V1730_CHANNELS,
                found: self.channels.len(),
            });
        }
        if !self.channels.iter().any(|c| c.enabled) {
            return Err(SettingsError::NothingEnabled {
                card: card.to_owned(),
            });
        }
        for (ch, c) in self.channels.iter().enumerate() {
            if ch % 2 == 0 {
                check_max(card, ch, "record_length", c.record_length, 65535)?;
            } else if c.record_length != self.channels[ch - 1].record_length {
                return Err(SettingsError::PairMismatch {
                    card: card.to_owned(),
                    channel: ch,
                });
            }
            if c.events_per_buffer < 2 {
                return Err(SettingsError::ChannelMinimum {
                    card: card.to_owned(),
                    field: "events_per_buffer",
                    min: 2,
                    channel: ch,
                });
            }
            check_max(card, ch, "events_per_buffer", c.events_per_buffer, 1023)?;
            check_max(card, ch, "pre_trigger", c.pre_trigger, 2044)?;
            check_max(card, ch, "short_gate", c.short_gate, 4095)?;
            check_max(card, ch, "long_gate", c.long_gate, 4095)?;
            check_max(card, ch, "gate_offset", c.gate_offset, 255)?;
            if c.pre_trigger < c.gate_offset + 19 {
                return Err(SettingsError::GateOffset {
                    card: card.to_owned(),
                    channel: ch,
                });
            }
            check_max(card, ch, "trigger_threshold", c.trigger_threshold, 4095)?;
            check_max(card, ch, "fixed_baseline", c.fixed_baseline, 4095)?;
            check_max(card, ch, "shaped_trigger_width", c.shaped_trigger_width, 1023)?;
            check_max(card, ch, "trigger_holdoff", c.trigger_holdoff, 4092)?;
            check_max(card, ch, "dc_offset", c.dc_offset, 65535)?;
            check_max(card, ch, "baseline_average", c.baseline_average, 4)?;
            check_max(card, ch, "pulse_polarity", c.pulse_polarity, 1)?;
        }
        Ok(())
    }

    /// Odd channels share memory with their even partner and take its record
    /// length and buffer depth.
    pub fn sync_pairs(&mut self) {
        for ch in (1..self.channels.len()).step_by(2) {
            self.channels[ch].record_length = self.channels[ch - 1].record_length;
            self.channels[ch].events_per_buffer = self.channels[ch - 1].events_per_buffer;
        }
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.enabled)
            .map(|(ch, _)| ch)
    }

    /// Bitmask of enabled channels
    pub fn channel_mask(&self) -> u32 {
        self.enabled_channels().fold(0, |m, ch| m | (1 << ch))
    }
}

/// One DRS4 group of eight channels
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct V1742Group {
    pub enabled: bool,
    pub dc_offsets: Vec<u16>,
}

impl Default for V1742Group {
    fn default() -> Self {
        Self {
            enabled: false,
            dc_offsets: vec![0x8000; V1742_GROUP_CHANNELS],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct V1742Settings {
    pub tr_enabled: bool,
    pub tr_readout: bool,
    /// 0 positive, 1 negative
    pub tr_polarity: u32,
    pub tr0_threshold: u16,
    pub tr1_threshold: u16,
    pub tr0_dc_offset: u16,
    pub tr1_dc_offset: u16,
    /// Index into 1024, 520, 256, 136 samples
    pub num_samples: u32,
    /// Index into 5, 2.5, 1 GS/s
    pub sample_freq: u32,
    pub software_trigger: bool,
    pub external_trigger: bool,
    /// In 8.5 ns steps
    pub trigger_offset: u32,
    pub max_event_blt: u32,
    pub groups: Vec<V1742Group>,
}

impl Default for V1742Settings {
    fn default() -> Self {
        Self {
            tr_enabled: false,
            tr_readout: false,
            tr_polarity: 0,
            tr0_threshold: 0x6666,
            tr1_threshold: 0x6666,
            tr0_dc_offset: 0x8000,
            tr1_dc_offset: 0x8000,
            num_samples: 0,
            sample_freq: 0,
            software_trigger: false,
            external_trigger: false,
            trigger_offset: 0,
            max_event_blt: 10,
            groups: vec![V1742Group::default(); V1742_GROUPS],
        }
    }
}

impl V1742Settings {
    pub fn normalize(&mut self, card: &str) -> Result<(), SettingsError> {
        if self.groups.len() > V1742_GROUPS {
            return Err(SettingsError::Count {
                card: card.to_owned(),
                what: "groups",
                expected: V1742_GROUPS,
                found: self.groups.len(),
            });
        }
        self.groups.resize(V1742_GROUPS, V1742Group::default());
        Ok(())
    }

    pub fn validate(&self, card: &str) -> Result<(), SettingsError> {
        let range = |field, value, max| {
            if value > max {
                Err(SettingsError::CardRange {
                    card: card.to_owned(),
                    field,
                    value,
                    max,
                })
            } else {
                Ok(())
            }
        };
        range("tr_polarity", self.tr_polarity, 1)?;
        range("num_samples", self.num_samples, 3)?;
        range("sample_freq", self.sample_freq, 2)?;
        range("trigger_offset", self.trigger_offset, 1023)?;
        range("max_event_blt", self.max_event_blt, 255)?;
        if self.groups.len() != V1742_GROUPS {
            return Err(SettingsError::Count {
                card: card.to_owned(),
                what: "groups",
                expected: V1742_GROUPS,
                found: self.groups.len(),
            });
        }
        for g in &self.groups {
            if g.dc_offsets.len() != V1742_GROUP_CHANNELS {
                return Err(SettingsError::Count {
                    card: card.to_owned(),
                    what: "group dc_offsets",
                    expected: V1742_GROUP_CHANNELS,
                    found: g.dc_offsets.len(),
                });
            }
        }
        if !self.groups.iter().any(|g| g.enabled) {
            return Err(SettingsError::NothingEnabled {
                card: card.to_owned(),
            });
        }
        Ok(())
    }

    pub fn samples_per_event(&self) -> usize {
        match self.num_samples {
            0 => 1024,
            1 => 520,
            2 => 256,
            _ => 136,
        }
    }

    pub fn ns_per_sample(&self) -> f64 {
        match self.sample_freq {
            0 => 0.2,
            1 => 0.4,
            _ => 1.0,
        }
    }

    pub fn enabled_groups(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.enabled)
            .map(|(gr, _)| gr)
    }

    pub fn group_mask(&self) -> u32 {
        self.enabled_groups().fold(0, |m, gr| m | (1 << gr))
    }

    pub fn dc_offset(&self, group: usize, channel: usize) -> u16 {
        self.groups[group].dc_offsets[channel]
    }
}

/// Settings for one card, tagged by model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DigitizerSettings {
    V1730(V1730Settings),
    V1742(V1742Settings),
}

impl DigitizerSettings {
    pub fn normalize(&mut self, card: &str) -> Result<(), SettingsError> {
        match self {
            Self::V1730(s) => s.normalize(card),
            Self::V1742(s) => s.normalize(card),
        }
    }

    pub fn validate(&self, card: &str) -> Result<(), SettingsError> {
        match self {
            Self::V1730(s) => s.validate(card),
            Self::V1742(s) => s.validate(card),
        }
    }

    pub fn model(&self) -> &'static str {
        match self {
            Self::V1730(_) => "V1730",
            Self::V1742(_) => "V1742",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_channel() -> V1730Settings {
        let mut s = V1730Settings::default();
        s.channels[0].enabled = true;
        s
    }

    #[test]
    fn test_defaults_validate() {
        one_channel().validate("psd").unwrap();
        let mut drs = V1742Settings::default();
        drs.groups[0].enabled = true;
        drs.validate("drs").unwrap();
    }

    #[test]
    fn test_nothing_enabled() {
        assert!(matches!(
            V1730Settings::default().validate("psd"),
            Err(SettingsError::NothingEnabled { .. })
        ));
    }

    #[test]
    fn test_pair_record_length() {
        let mut s = one_channel();
        s.channels[4].record_length = 256;
        assert_eq!(
            s.validate("psd"),
            Err(SettingsError::PairMismatch {
                card: "psd".into(),
                channel: 5
            })
        );
        s.sync_pairs();
        s.validate("psd").unwrap();
        assert_eq!(s.channels[5].record_length, 256);
    }

    #[test]
    fn test_gate_offset_margin() {
        let mut s = one_channel();
        s.channels[2].pre_trigger = 24;
        s.channels[2].gate_offset = 5;
        s.validate("psd").unwrap();
        s.channels[2].pre_trigger = 23;
        assert_eq!(
            s.validate("psd"),
            Err(SettingsError::GateOffset {
                card: "psd".into(),
                channel: 2
            })
        );
    }

    #[test]
    fn test_channel_ranges() {
        let mut s = one_channel();
        s.channels[3].events_per_buffer = 1;
        assert!(matches!(
            s.validate("psd"),
            Err(SettingsError::ChannelMinimum { channel: 3, .. })
        ));
        let mut s = one_channel();
        s.channels[7].trigger_threshold = 4096;
        assert!(matches!(
            s.validate("psd"),
            Err(SettingsError::ChannelRange {
                field: "trigger_threshold",
                channel: 7,
                ..
            })
        ));
    }

    #[test]
    fn test_normalize_pads_channels() {
        let mut s = V1730Settings {
            card: V1730Card::default(),
            channels: vec![V1730Channel {
                enabled: true,
                ..Default::default()
            }],
        };
        assert!(s.validate("psd").is_err());
        s.normalize("psd").unwrap();
        s.validate("psd").unwrap();
        assert_eq!(s.channel_mask(), 0b1);
    }

    #[test]
    fn test_v1742_ranges() {
        let mut s = V1742Settings::default();
        s.groups[1].enabled = true;
        s.num_samples = 4;
        assert!(matches!(
            s.validate("drs"),
            Err(SettingsError::CardRange {
                field: "num_samples",
                ..
            })
        ));
        s.num_samples = 2;
        assert_eq!(s.samples_per_event(), 256);
        s.groups[2].dc_offsets.pop();
        assert!(matches!(s.validate("drs"), Err(SettingsError::Count { .. })));
    }

    #[test]
    fn test_tagged_json() {
        let json = r#"{
            "type": "v1730",
            "aggregates_per_transfer": 8,
            "channels": [ { "enabled": true, "record_length": 96 } ]
        }"#;
        let mut s: DigitizerSettings = serde_json::from_str(json).unwrap();
        s.normalize("psd").unwrap();
        s.validate("psd").unwrap_err();
        let DigitizerSettings::V1730(psd) = &mut s else {
            panic!("wrong model");
        };
        assert_eq!(psd.card.aggregates_per_transfer, 8);
        psd.sync_pairs();
        s.validate("psd").unwrap();
        assert_eq!(s.model(), "V1730");
    }
}
