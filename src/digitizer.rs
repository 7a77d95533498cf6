//! The hardware access seam
//!
//! Register programming and VME transfers live behind [`Digitizer`]. Everything
//! here must return within a few milliseconds; the readout loop polls it at high
//! rate and never waits on anything else.

use tracing::info;

use crate::{
    decoder::{Drs4Decoder, FrameDecoder, OverflowPolicy, PsdDecoder},
    error::{DaqError, HardwareError},
    settings::DigitizerSettings,
};

pub trait Digitizer: Send {
    /// Name of the card, used for log lines and output paths
    fn index(&self) -> &str;

    /// Apply validated settings and return what the hardware actually took,
    /// including any corrections it made (record length rounding, pair sharing).
    fn program(&mut self, settings: &DigitizerSettings) -> Result<DigitizerSettings, HardwareError>;

    fn start(&mut self) -> Result<(), HardwareError>;

    fn stop(&mut self) -> Result<(), HardwareError>;

    /// Force one trigger, used to line up cards sharing a trigger link
    fn software_trigger(&mut self) -> Result<(), HardwareError>;

    /// Whether a block transfer would return data
    fn ready_for_readout(&mut self) -> Result<bool, HardwareError>;

    /// Move up to `dst.len()` bytes of event data into `dst`, returning the count.
    fn block_transfer(&mut self, dst: &mut [u8]) -> Result<usize, HardwareError>;

    fn is_acquiring(&mut self) -> Result<bool, HardwareError>;

    /// Temperatures in degrees C, one per channel or group
    fn read_temperatures(&mut self) -> Result<Vec<u32>, HardwareError>;
}

/// Validate, program, and re-check a card's settings, then build its decoder
/// from the copy the hardware echoed back.
pub fn arm_card(
    dgtz: &mut dyn Digitizer,
    settings: &DigitizerSettings,
    capacity: usize,
    overflow: OverflowPolicy,
) -> Result<(DigitizerSettings, FrameDecoder), DaqError> {
    let card = dgtz.index().to_owned();
    settings.validate(&card)?;
    let applied = dgtz.program(settings)?;
    // The echoed copy is what the frames will carry, so it wins
    applied.validate(&card)?;
    if &applied != settings {
        info!(card = %card, "Hardware adjusted settings while programming");
    }
    let decoder = match &applied {
        DigitizerSettings::V1730(s) => PsdDecoder::new(&card, s, capacity, overflow).into(),
        DigitizerSettings::V1742(s) => Drs4Decoder::new(&card, s, capacity, overflow).into(),
    };
    info!(card = %card, model = applied.model(), "Programmed");
    Ok((applied, decoder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::SettingsError,
        settings::{V1730Settings, V1742Settings},
        sim::SimulatedDigitizer,
    };

    #[test]
    fn test_echoed_record_length_wins() {
        let mut s = V1730Settings::default();
        s.channels[2].enabled = true;
        s.channels[2].record_length = 100;
        s.channels[3].record_length = 100;
        let mut dgtz = SimulatedDigitizer::new("psd0", 1);
        let (applied, decoder) = arm_card(
            &mut dgtz,
            &DigitizerSettings::V1730(s),
            4,
            OverflowPolicy::Fatal,
        )
        .unwrap();
        let DigitizerSettings::V1730(applied) = applied else {
            panic!("model changed");
        };
        assert_eq!(applied.channels[2].record_length, 104);
        assert_eq!(applied.channels[3].record_length, 104);
        assert_eq!(decoder.store().get(0).unwrap().n_samples(), 104);
        assert_eq!(decoder.card(), "psd0");
    }

    #[test]
    fn test_invalid_settings_never_programmed() {
        let mut s = V1742Settings::default();
        s.groups[0].enabled = true;
        s.sample_freq = 3;
        let mut dgtz = SimulatedDigitizer::new("drs0", 1);
        let err = arm_card(
            &mut dgtz,
            &DigitizerSettings::V1742(s),
            4,
            OverflowPolicy::Fatal,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DaqError::Settings(SettingsError::CardRange {
                field: "sample_freq",
                ..
            })
        ));
        assert!(dgtz.applied().is_none());
    }
}
