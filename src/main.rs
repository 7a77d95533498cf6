use std::thread;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{debug, info, warn};
use wave_slurper::{
    args::{convert_filter, Args},
    config::{OutputFormat, RunConfig},
    monitoring::{Monitor, RunEvent},
    orchestrator::{Acquisition, RunOptions},
    sim::SimulatedDigitizer,
    sink::{RawFiles, SinkFactory},
};

const MONITOR_DEPTH: usize = 1024;

fn sink_factory(format: OutputFormat) -> anyhow::Result<Box<dyn SinkFactory>> {
    match format {
        OutputFormat::Raw => Ok(Box::new(RawFiles)),
        #[cfg(feature = "hdf5")]
        OutputFormat::Hdf5 => Ok(Box::new(wave_slurper::sink::Hdf5Files)),
        #[cfg(not(feature = "hdf5"))]
        OutputFormat::Hdf5 => bail!("HDF5 output needs the `hdf5` feature"),
    }
}

fn log_event(event: RunEvent) {
    match event {
        RunEvent::Decoded {
            card,
            bytes,
            fill_pct,
            ..
        } => debug!(card = %card, bytes, fill_pct, "Decoded"),
        RunEvent::Draining(reason) => debug!(?reason, "Draining"),
        RunEvent::Flushed { file, events, .. } => debug!(file = %file, events, "Flushed"),
        RunEvent::State(_) | RunEvent::Temperatures { .. } => (),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let mut config = RunConfig::load(&args.config)
        .with_context(|| format!("Loading run database {}", args.config.display()))?;
    if let Some(outfile) = args.outfile {
        config.run.outfile = outfile;
    }

    let Some(rate) = args.simulate else {
        bail!("No VME backend is built in, run with --simulate <HZ>");
    };

    // Setup the monitoring channel
    let (sender, receiver) = bounded(MONITOR_DEPTH);
    let mut acq = Acquisition::new(
        RunOptions::from(&config.run),
        config.run.policy(),
        sink_factory(config.run.format)?,
    )
    .with_monitor(Monitor::new(sender))
    .with_run_config(serde_json::to_string(&config).context("Encoding the run database")?);

    for (i, d) in config.digitizers.iter().enumerate() {
        info!(
            card = %d.index,
            link = d.link,
            base_address = d.base_address,
            rate,
            "Simulating digitizer"
        );
        let dgtz = SimulatedDigitizer::new(&d.index, args.seed.wrapping_add(i as u64)).with_rate(rate);
        acq.add_card(Box::new(dgtz), d.settings.clone())?;
    }

    let stop = acq.stop_token();
    ctrlc::set_handler(move || stop.request()).context("Installing the Ctrl-C handler")?;

    let listener = thread::Builder::new()
        .name("monitor".to_owned())
        .spawn(move || receiver.into_iter().for_each(log_event))?;

    acq.arm().context("Arming digitizers")?;
    info!("Starting run, Ctrl-C to stop");
    let summary = acq.run();
    // Hang up the monitor channel so the listener finishes
    drop(acq);
    listener
        .join()
        .map_err(|_| anyhow!("Monitor thread panicked"))?;
    let summary = summary.context("Run failed")?;

    info!(reason = ?summary.drain_reason, files = summary.files.len(), "Run finished");
    for card in &summary.cards {
        for (label, grabbed) in &card.grabbed {
            info!(card = %card.card, channel = %label, grabbed, "Events");
        }
        if card.dropped > 0 {
            warn!(card = %card.card, dropped = card.dropped, "Events dropped on overflow");
        }
        let seq = &card.sequence;
        if seq.duplicates + seq.orphans + seq.missed > 0 {
            warn!(card = %card.card, ?seq, "Trigger sequence gaps");
        }
    }
    Ok(())
}
