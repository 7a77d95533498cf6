//! This module is responsible for getting decoded events out to disk

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    buffer::BufferConsumer,
    decoder::{check_aggregate_fits, FrameDecoder},
    error::DaqError,
    monitoring::{DrainReason, RunEvent},
    orchestrator::RunControl,
    policy::RunCyclePolicy,
    sink::{RecordSink, SinkFactory},
};

// Longest we sleep without data, so timed runs still end on time
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Run-level attributes stamped into every output file
#[derive(Clone, Debug)]
pub struct RunHeader {
    pub run_start: DateTime<Utc>,
    /// The run database as loaded, so every file describes its own run
    pub run_config: String,
}

impl RunHeader {
    pub fn new(run_config: impl Into<String>) -> Self {
        Self {
            run_start: Utc::now(),
            run_config: run_config.into(),
        }
    }
}

/// Decode whatever every buffer holds. Returns whether any bytes were consumed.
fn decode_pass(
    decoders: &mut [FrameDecoder],
    consumers: &mut [BufferConsumer],
    ctl: &RunControl,
) -> Result<bool, DaqError> {
    let mut progressed = false;
    for (dec, consumer) in decoders.iter_mut().zip(consumers.iter_mut()) {
        let fill_pct = consumer.buffer().pct();
        let capacity = consumer.buffer().capacity();
        let slot = consumer.read_slot();
        if slot.is_empty() {
            continue;
        }
        let used = dec.decode(&slot)?;
        if used == 0 {
            check_aggregate_fits(dec.card(), &slot, capacity)?;
        }
        // Anything past `used` is a partial aggregate and stays for next time
        slot.commit(used);
        if used > 0 {
            progressed = true;
            let rates = dec.rates();
            ctl.monitor().publish(RunEvent::Decoded {
                card: dec.card().to_owned(),
                bytes: used,
                fill_pct,
                rates,
            });
        }
    }
    Ok(progressed)
}

fn write_header(
    sink: &mut dyn RecordSink,
    header: &RunHeader,
    cycle: usize,
    n: usize,
    file_runtime: Duration,
) -> Result<(), DaqError> {
    sink.attr_str("/", "run_start", &header.run_start.to_rfc3339())?;
    sink.attr_str("/", "created", &Utc::now().to_rfc3339())?;
    sink.attr_str("/", "run_config", &header.run_config)?;
    sink.attr_f64("/", "file_runtime", file_runtime.as_secs_f64())?;
    sink.attr_u32("/", "cycle", cycle as u32)?;
    sink.attr_u32("/", "events", n as u32)?;
    Ok(())
}

/// Write the first `n` events of every card into one output. The file only
/// appears once the sink closes cleanly.
fn write_cycle(
    decoders: &mut [FrameDecoder],
    sinks: &mut dyn SinkFactory,
    name: &str,
    cycle: usize,
    n: usize,
    header: &RunHeader,
    file_runtime: Duration,
) -> Result<(), DaqError> {
    info!(file = name, cycle, events = n, "Saving data");
    let mut sink = sinks.create(name)?;
    write_header(sink.as_mut(), header, cycle, n, file_runtime)?;
    for dec in decoders.iter_mut() {
        dec.write_out(sink.as_mut(), n)?;
    }
    sink.close()?;
    Ok(())
}

/// Decode until readout has finished and every buffer is drained, flushing
/// whenever the policy says so. Returns the names of the files written.
pub fn decode_loop(
    decoders: &mut [FrameDecoder],
    consumers: &mut [BufferConsumer],
    policy: &mut RunCyclePolicy,
    sinks: &mut dyn SinkFactory,
    ctl: &RunControl,
    header: &RunHeader,
) -> Result<Vec<String>, DaqError> {
    let mut files = Vec::new();
    let mut file_start = Instant::now();
    loop {
        let seen = ctl.signal().generation();
        let progressed = decode_pass(decoders, consumers, ctl)?;

        let ready: Vec<usize> = ctl
            .signal()
            .locked(|| decoders.iter().map(FrameDecoder::events_ready).collect());
        if policy.should_flush(&ready) {
            let n = policy.flush_count(&ready);
            let name = policy.file_name();
            let cycle = policy.cycle();
            let now = Instant::now();
            write_cycle(decoders, sinks, &name, cycle, n, header, now - file_start)?;
            file_start = now;
            ctl.monitor().publish(RunEvent::Flushed {
                file: name.clone(),
                cycle,
                events: n,
            });
            files.push(name);
            if !policy.on_flushed() {
                ctl.halt(DrainReason::RunComplete);
                break;
            }
            continue;
        }

        if progressed {
            continue;
        }
        // Readout is done and nothing was committed since this pass started
        if ctl.readout_done() && ctl.signal().generation() == seen {
            break;
        }
        ctl.signal()
            .wait_for_change_timeout(seen, IDLE_TICK, || ctl.readout_done());
    }
    for (dec, consumer) in decoders.iter().zip(consumers.iter()) {
        if consumer.fill() > 0 {
            warn!(
                card = dec.card(),
                bytes = consumer.fill(),
                "Partial aggregate left undecoded"
            );
        }
    }
    debug!(files = files.len(), "Decoding finished");
    Ok(files)
}
