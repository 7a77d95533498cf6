//! The JSON run database
//!
//! ```json
//! { "run": { "outfile": "data", "events": 1000, "repeat_times": 0, "arm_last": "psd0" },
//!   "digitizers": [ { "index": "psd0", "type": "v1730", "channels": [ { "enabled": true } ] } ] }
//! ```

use std::{collections::HashSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    decoder::OverflowPolicy,
    error::{DaqError, SettingsError},
    policy::RunCyclePolicy,
    settings::DigitizerSettings,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Raw,
    Hdf5,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Output base name; cycle number and extension are appended
    pub outfile: String,
    pub format: OutputFormat,
    /// Events per card per file. Zero never flushes (rate monitoring only).
    pub events: usize,
    pub repeat_times: usize,
    /// Stored events per channel; defaults to 1.5x the flush size
    pub event_buffer: Option<usize>,
    pub overflow: OverflowPolicy,
    /// Host buffer per card, in bytes
    pub buffer_bytes: usize,
    pub check_temps: bool,
    /// Degrees C at which the run is drained
    pub temp_danger: u32,
    /// Seconds between temperature polls
    pub check_temps_every: f64,
    /// Run for this long instead of a fixed event count
    pub runtime_secs: Option<f64>,
    pub events_per_file: usize,
    /// Card started after all the others, when it gates a shared trigger
    pub arm_last: Option<String>,
    /// Card given one software trigger right after it starts
    pub soft_trig: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            outfile: "data".to_owned(),
            format: OutputFormat::default(),
            events: 1000,
            repeat_times: 0,
            event_buffer: None,
            overflow: OverflowPolicy::default(),
            buffer_bytes: 100 * 1024 * 1024,
            check_temps: true,
            temp_danger: 60,
            check_temps_every: 10.0,
            runtime_secs: None,
            events_per_file: 1000,
            arm_last: None,
            soft_trig: None,
        }
    }
}

impl RunSettings {
    /// Events flushed per file under the configured policy
    pub fn flush_size(&self) -> usize {
        if self.runtime_secs.is_some() {
            self.events_per_file
        } else {
            self.events
        }
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer
            .unwrap_or_else(|| self.flush_size() + self.flush_size() / 2)
    }

    pub fn policy(&self) -> RunCyclePolicy {
        match self.runtime_secs {
            Some(secs) => RunCyclePolicy::timed(
                &self.outfile,
                Duration::from_secs_f64(secs),
                self.events_per_file,
            ),
            None => RunCyclePolicy::event_count(&self.outfile, self.events, self.repeat_times),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DigitizerConfig {
    pub index: String,
    #[serde(default)]
    pub link: u32,
    #[serde(default)]
    pub base_address: u32,
    #[serde(flatten)]
    pub settings: DigitizerSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub run: RunSettings,
    pub digitizers: Vec<DigitizerConfig>,
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DaqError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse, fill in omitted channels, and validate everything.
    pub fn from_json(text: &str) -> Result<Self, DaqError> {
        let mut config: RunConfig = serde_json::from_str(text)?;
        for d in &mut config.digitizers {
            d.settings.normalize(&d.index)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let run = &self.run;
        if self.digitizers.is_empty() {
            return Err(SettingsError::Run("no digitizers configured".to_owned()));
        }
        let mut seen = HashSet::new();
        for d in &self.digitizers {
            if !seen.insert(d.index.as_str()) {
                return Err(SettingsError::Run(format!("duplicate index {}", d.index)));
            }
            d.settings.validate(&d.index)?;
        }
        if run.buffer_bytes == 0 {
            return Err(SettingsError::Run("buffer_bytes must be non-zero".to_owned()));
        }
        let buffer = run.event_buffer();
        if buffer > 0 && buffer < run.flush_size() {
            return Err(SettingsError::Run(format!(
                "event_buffer {buffer} is smaller than the {} events flushed per file",
                run.flush_size()
            )));
        }
        if run.runtime_secs.map_or(false, |s| !s.is_finite() || s < 0.0) {
            return Err(SettingsError::Run("runtime_secs must be non-negative".to_owned()));
        }
        if run.runtime_secs.is_some() && run.events_per_file == 0 {
            return Err(SettingsError::Run(
                "a timed run cannot go into one file, events_per_file must be non-zero".to_owned(),
            ));
        }
        if !run.check_temps_every.is_finite() || run.check_temps_every < 0.0 {
            return Err(SettingsError::Run(
                "check_temps_every must be non-negative".to_owned(),
            ));
        }
        for (field, card) in [("arm_last", &run.arm_last), ("soft_trig", &run.soft_trig)] {
            if let Some(card) = card {
                if !seen.contains(card.as_str()) {
                    return Err(SettingsError::Run(format!("{field} names unknown card {card}")));
                }
            }
        }
        Ok(())
    }
}
