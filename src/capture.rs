//! This module contains all the readout logic

// The readout thread will do one thing, as fast as possible:
// Move bytes off the cards and into the host buffers, and that's it.
// Decoding happens in another thread, so nothing here may block on it.
// When a buffer is full we just skip that card until the decoder catches up.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::{
    buffer::BufferProducer,
    digitizer::Digitizer,
    error::DaqError,
    monitoring::{DrainReason, RunEvent},
    orchestrator::{stop_order, RunControl, RunOptions},
};

// Idle passes spent spinning before we start handing the core back
const IDLE_SPINS: u32 = 1024;

/// One block transfer into the free region of `producer`. Returns zero when the
/// buffer has no room.
fn transfer(dgtz: &mut dyn Digitizer, producer: &mut BufferProducer) -> Result<usize, DaqError> {
    let slot = producer.write_slot();
    if slot.is_empty() {
        return Ok(0);
    }
    let n = dgtz.block_transfer(slot)?;
    producer.commit_write(n);
    Ok(n)
}

fn check_temperatures(
    digitizers: &mut [Box<dyn Digitizer>],
    ctl: &RunControl,
    danger: u32,
) -> Result<(), DaqError> {
    for dgtz in digitizers.iter_mut() {
        let card = dgtz.index().to_owned();
        let temps = dgtz.read_temperatures()?;
        info!(card = %card, ?temps, "Temperatures");
        let hot = temps
            .iter()
            .enumerate()
            .find(|(_, t)| **t >= danger)
            .map(|(channel, temp)| (channel, *temp));
        ctl.monitor().publish(RunEvent::Temperatures {
            card: card.clone(),
            temps,
        });
        if let Some((channel, temp)) = hot {
            error!(card = %card, channel, temp, "Temperature over the danger level");
            ctl.begin_drain(DrainReason::OverTemperature {
                card,
                channel,
                temp,
            });
        }
    }
    Ok(())
}

/// Poll every card until a stop or drain is requested, then sweep up what the
/// cards still hold.
pub fn readout_loop(
    digitizers: &mut [Box<dyn Digitizer>],
    producers: &mut [BufferProducer],
    ctl: &RunControl,
    opts: &RunOptions,
) -> Result<(), DaqError> {
    let mut stalled = vec![false; digitizers.len()];
    let mut transfers = 0u64;
    let mut idle = 0u32;
    let mut last_temps: Option<Instant> = None;
    loop {
        if ctl.stop().is_requested() {
            ctl.begin_drain(DrainReason::Interrupted);
            break;
        }
        if ctl.is_draining() {
            break;
        }
        let mut moved = false;
        for ((dgtz, producer), stalled) in digitizers
            .iter_mut()
            .zip(producers.iter_mut())
            .zip(stalled.iter_mut())
        {
            if dgtz.ready_for_readout()? {
                if transfer(dgtz.as_mut(), producer)? > 0 {
                    moved = true;
                    *stalled = false;
                } else if !*stalled {
                    // Backpressure, the decoder owns the rest of the buffer
                    warn!(card = dgtz.index(), "Host buffer full");
                    *stalled = true;
                }
            } else if !dgtz.is_acquiring()? {
                ctl.begin_drain(DrainReason::AcquisitionHalted {
                    card: dgtz.index().to_owned(),
                });
            }
        }
        // Cards can cook with no triggers arriving, so this runs on the clock
        if opts.check_temps && last_temps.map_or(true, |t| t.elapsed() >= opts.temp_interval) {
            last_temps = Some(Instant::now());
            check_temperatures(digitizers, ctl, opts.temp_danger)?;
        }
        if moved {
            transfers += 1;
            idle = 0;
        } else if idle < IDLE_SPINS {
            // Spin until there's data
            idle += 1;
            std::hint::spin_loop();
        } else {
            // Nothing for a while, so a scheduler round trip costs us little
            std::thread::yield_now();
        }
    }
    // Stop triggering, then sweep up whatever the cards already hold
    for i in stop_order(digitizers, opts.arm_last.as_deref()) {
        let (dgtz, producer) = (&mut digitizers[i], &mut producers[i]);
        dgtz.stop()?;
        while dgtz.ready_for_readout()? {
            if transfer(dgtz.as_mut(), producer)? == 0 {
                warn!(card = dgtz.index(), "Host buffer full at shutdown, data left on card");
                break;
            }
        }
    }
    debug!(transfers, "Readout finished");
    Ok(())
}
