//! Run lifecycle: arm the cards, run the two loops, tear down
//!
//! ```text
//! Idle --arm--> Armed --run--> Running --(drain)--> Draining --> Stopped
//! ```
//!
//! The readout loop owns the cards and the producer half of every buffer. The
//! decode loop owns the decoders, the consumer halves, the cycle policy, and the
//! sink factory. They share only a [`RunControl`].

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use tracing::{error, info, warn};

use crate::{
    buffer::{BufferConsumer, BufferProducer, RawByteBuffer, WorkSignal},
    capture::readout_loop,
    config::RunSettings,
    decoder::{FrameDecoder, OverflowPolicy},
    digitizer::{arm_card, Digitizer},
    error::{DaqError, DaqResult, SettingsError},
    exfil::{decode_loop, RunHeader},
    monitoring::{CardSummary, DrainReason, Monitor, RunEvent, RunSummary},
    policy::RunCyclePolicy,
    settings::DigitizerSettings,
    sink::SinkFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Armed,
    Running,
    Draining,
    Stopped,
}

/// Cloneable stop request, safe to trip from a signal handler
#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State shared by the readout and decode loops
pub struct RunControl {
    stop: StopToken,
    signal: Arc<WorkSignal>,
    drain: Mutex<Option<DrainReason>>,
    readout_done: AtomicBool,
    monitor: Monitor,
}

impl RunControl {
    pub fn new(stop: StopToken, signal: Arc<WorkSignal>, monitor: Monitor) -> Self {
        Self {
            stop,
            signal,
            drain: Mutex::new(None),
            readout_done: AtomicBool::new(false),
            monitor,
        }
    }

    pub fn stop(&self) -> &StopToken {
        &self.stop
    }

    pub fn signal(&self) -> &WorkSignal {
        &self.signal
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Stop taking new data. The first reason given sticks.
    pub fn begin_drain(&self, reason: DrainReason) {
        let first = {
            let mut drain = self.drain.lock().unwrap_or_else(PoisonError::into_inner);
            if drain.is_none() {
                *drain = Some(reason.clone());
                true
            } else {
                false
            }
        };
        if first {
            match &reason {
                DrainReason::Failed => error!("Draining after a fatal error"),
                DrainReason::RunComplete | DrainReason::Interrupted => {
                    info!(?reason, "Draining")
                }
                _ => warn!(?reason, "Draining"),
            }
            self.monitor.publish(RunEvent::Draining(reason));
            self.monitor.publish(RunEvent::State(RunState::Draining));
        }
        self.signal.notify();
    }

    /// Drain and stop both loops
    pub fn halt(&self, reason: DrainReason) {
        // Reason first, so the readout loop never reads the stop as an interrupt
        self.begin_drain(reason);
        self.stop.request();
        self.signal.notify();
    }

    pub fn is_draining(&self) -> bool {
        self.drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn drain_reason(&self) -> Option<DrainReason> {
        self.drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The readout loop has made its last commit
    pub fn finish_readout(&self) {
        self.readout_done.store(true, Ordering::SeqCst);
        self.signal.notify();
    }

    pub fn readout_done(&self) -> bool {
        self.readout_done.load(Ordering::SeqCst)
    }
}

// Marks readout finished even if the loop panics, so the decoder never waits forever
struct ReadoutGuard<'a>(&'a RunControl);

impl Drop for ReadoutGuard<'_> {
    fn drop(&mut self) {
        self.0.finish_readout();
    }
}

// Stops readout once the decoder is gone, whatever the reason
struct DecodeGuard<'a>(&'a RunControl);

impl Drop for DecodeGuard<'_> {
    fn drop(&mut self) {
        self.0.halt(DrainReason::Failed);
    }
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Stored events per channel
    pub event_buffer: usize,
    /// Host buffer per card
    pub buffer_bytes: usize,
    pub overflow: OverflowPolicy,
    pub check_temps: bool,
    pub temp_danger: u32,
    pub temp_interval: Duration,
    pub arm_last: Option<String>,
    pub soft_trig: Option<String>,
}

impl From<&RunSettings> for RunOptions {
    fn from(run: &RunSettings) -> Self {
        Self {
            event_buffer: run.event_buffer(),
            buffer_bytes: run.buffer_bytes,
            overflow: run.overflow,
            check_temps: run.check_temps,
            temp_danger: run.temp_danger,
            temp_interval: Duration::from_secs_f64(run.check_temps_every),
            arm_last: run.arm_last.clone(),
            soft_trig: run.soft_trig.clone(),
        }
    }
}

fn position(digitizers: &[Box<dyn Digitizer>], card: Option<&str>) -> Option<usize> {
    let card = card?;
    digitizers.iter().position(|d| d.index() == card)
}

/// Card indices in start order. The `arm_last` card goes at the end so every
/// other card is already waiting on its trigger.
pub fn start_order(digitizers: &[Box<dyn Digitizer>], arm_last: Option<&str>) -> Vec<usize> {
    let last = position(digitizers, arm_last);
    let mut order: Vec<usize> = (0..digitizers.len()).filter(|i| Some(*i) != last).collect();
    order.extend(last);
    order
}

/// Card indices in stop order, `arm_last` first
pub fn stop_order(digitizers: &[Box<dyn Digitizer>], arm_last: Option<&str>) -> Vec<usize> {
    let first = position(digitizers, arm_last);
    let mut order: Vec<usize> = first.into_iter().collect();
    order.extend((0..digitizers.len()).filter(|i| Some(*i) != first));
    order
}

struct Armed {
    decoders: Vec<FrameDecoder>,
    producers: Vec<BufferProducer>,
    consumers: Vec<BufferConsumer>,
    signal: Arc<WorkSignal>,
}

pub struct Acquisition {
    state: RunState,
    options: RunOptions,
    digitizers: Vec<Box<dyn Digitizer>>,
    settings: Vec<DigitizerSettings>,
    policy: RunCyclePolicy,
    sinks: Box<dyn SinkFactory>,
    stop: StopToken,
    monitor: Monitor,
    run_config: String,
    armed: Option<Armed>,
}

impl Acquisition {
    pub fn new(options: RunOptions, policy: RunCyclePolicy, sinks: Box<dyn SinkFactory>) -> Self {
        Self {
            state: RunState::Idle,
            options,
            digitizers: Vec::new(),
            settings: Vec::new(),
            policy,
            sinks,
            stop: StopToken::new(),
            monitor: Monitor::default(),
            run_config: String::new(),
            armed: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Run database text stored in every output file
    pub fn with_run_config(mut self, text: impl Into<String>) -> Self {
        self.run_config = text.into();
        self
    }

    /// Handle for requesting a stop from another thread
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn set_state(&mut self, state: RunState) {
        info!(?state, "Run state");
        self.state = state;
        self.monitor.publish(RunEvent::State(state));
    }

    fn expect_state(&self, expected: RunState, action: &'static str) -> DaqResult<()> {
        if self.state != expected {
            return Err(DaqError::State {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    pub fn add_card(
        &mut self,
        dgtz: Box<dyn Digitizer>,
        settings: DigitizerSettings,
    ) -> DaqResult<()> {
        self.expect_state(RunState::Idle, "add a card")?;
        self.digitizers.push(dgtz);
        self.settings.push(settings);
        Ok(())
    }

    /// Program every card and allocate its buffers and record store.
    pub fn arm(&mut self) -> DaqResult<()> {
        self.expect_state(RunState::Idle, "arm")?;
        if self.digitizers.is_empty() {
            return Err(SettingsError::Run("no digitizers to arm".to_owned()).into());
        }
        let signal = Arc::new(WorkSignal::new());
        let mut armed = Armed {
            decoders: Vec::with_capacity(self.digitizers.len()),
            producers: Vec::with_capacity(self.digitizers.len()),
            consumers: Vec::with_capacity(self.digitizers.len()),
            signal: signal.clone(),
        };
        for (dgtz, settings) in self.digitizers.iter_mut().zip(self.settings.iter_mut()) {
            let (applied, decoder) = arm_card(
                dgtz.as_mut(),
                settings,
                self.options.event_buffer,
                self.options.overflow,
            )?;
            *settings = applied;
            let (producer, consumer) =
                RawByteBuffer::with_signal(self.options.buffer_bytes, signal.clone());
            armed.decoders.push(decoder);
            armed.producers.push(producer);
            armed.consumers.push(consumer);
        }
        self.armed = Some(armed);
        self.set_state(RunState::Armed);
        Ok(())
    }

    /// Settings as the hardware took them, once armed
    pub fn applied_settings(&self) -> &[DigitizerSettings] {
        &self.settings
    }

    /// Start the cards and block until the run ends.
    pub fn run(&mut self) -> DaqResult<RunSummary> {
        self.expect_state(RunState::Armed, "run")?;
        let Some(Armed {
            mut decoders,
            mut producers,
            mut consumers,
            signal,
        }) = self.armed.take()
        else {
            return Err(DaqError::State {
                action: "run",
                state: self.state,
            });
        };

        if let Err(e) = self.start_cards() {
            self.stop_cards();
            self.set_state(RunState::Stopped);
            return Err(e);
        }
        self.policy.start();
        self.set_state(RunState::Running);

        let ctl = RunControl::new(self.stop.clone(), signal, self.monitor.clone());
        let header = RunHeader::new(self.run_config.as_str());
        let Self {
            options,
            digitizers,
            policy,
            sinks,
            ..
        } = self;

        let ctl = &ctl;
        let header = &header;
        let readout_cards = (&mut producers, options);
        let decode_parts = (&mut decoders, &mut consumers);
        let joined: DaqResult<_> = thread::scope(|s| {
            let readout = thread::Builder::new()
                .name("readout".to_owned())
                .spawn_scoped(s, move || {
                    let _guard = ReadoutGuard(ctl);
                    let (producers, options) = readout_cards;
                    let result = readout_loop(digitizers, producers, ctl, options);
                    if let Err(e) = &result {
                        error!("Readout failed: {e}");
                        ctl.halt(DrainReason::Failed);
                    }
                    result
                })?;
            let decode = thread::Builder::new()
                .name("decode".to_owned())
                .spawn_scoped(s, move || {
                    let _guard = DecodeGuard(ctl);
                    let (decoders, consumers) = decode_parts;
                    let result =
                        decode_loop(decoders, consumers, policy, sinks.as_mut(), ctl, header);
                    if let Err(e) = &result {
                        error!("Decoding failed: {e}");
                    }
                    result
                });
            let decode = match decode {
                Ok(handle) => handle,
                Err(e) => {
                    ctl.halt(DrainReason::Failed);
                    let _ = readout.join();
                    return Err(e.into());
                }
            };
            let readout = readout.join().map_err(|_| DaqError::ThreadPanic("readout"));
            let decode = decode.join().map_err(|_| DaqError::ThreadPanic("decode"));
            Ok((readout, decode))
        });

        self.stop_cards();
        let drain_reason = ctl.drain_reason();
        let summary = RunSummary {
            files: Vec::new(),
            cards: decoders
                .iter()
                .zip(&producers)
                .map(|(dec, producer)| card_summary(dec, producer))
                .collect(),
            drain_reason,
        };
        self.set_state(RunState::Stopped);

        let (readout, decode) = joined?;
        let files = decode??;
        readout??;
        for card in &summary.cards {
            info!(
                card = %card.card,
                bytes = card.bytes_read,
                dropped = card.dropped,
                "Card finished"
            );
        }
        Ok(RunSummary { files, ..summary })
    }

    fn start_cards(&mut self) -> DaqResult<()> {
        let soft_trig = self.options.soft_trig.as_deref();
        for i in start_order(&self.digitizers, self.options.arm_last.as_deref()) {
            let dgtz = &mut self.digitizers[i];
            dgtz.start()?;
            if soft_trig == Some(dgtz.index()) {
                info!(card = dgtz.index(), "Software triggering");
                dgtz.software_trigger()?;
            }
        }
        Ok(())
    }

    fn stop_cards(&mut self) {
        for i in stop_order(&self.digitizers, self.options.arm_last.as_deref()) {
            let dgtz = &mut self.digitizers[i];
            if let Err(e) = dgtz.stop() {
                warn!(card = dgtz.index(), "Failed to stop card: {e}");
            }
        }
    }
}

fn card_summary(dec: &FrameDecoder, producer: &BufferProducer) -> CardSummary {
    let store = dec.store();
    CardSummary {
        card: dec.card().to_owned(),
        bytes_read: producer.buffer().produced_total(),
        compactions: producer.buffer().compactions(),
        grabbed: store
            .iter()
            .map(|r| (r.label().to_owned(), r.grabbed()))
            .collect(),
        dropped: store.iter().map(|r| r.dropped()).sum(),
        sequence: dec.sequence_stats().clone(),
    }
}
