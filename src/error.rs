//! Error types for the acquisition pipeline
//!
//! Every fatal condition a run can hit ends up in [`DaqError`]. Decode failures
//! are kept separate in [`DecodeError`] so tests can match on the exact framing
//! problem without going through the umbrella type.

use thiserror::Error;

pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Unrecoverable problems found while walking a raw byte stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{card}: aggregate missing tag (word 0x{word:08x} at byte {offset})")]
    MissingTag {
        card: String,
        word: u32,
        offset: usize,
    },

    #[error("{card}: channel aggregate format flag not set (word 0x{word:08x})")]
    MissingFormat { card: String, word: u32 },

    #[error("{card}: declared {frame} size of {declared} words but {consumed} were consumed")]
    FrameSize {
        card: String,
        frame: &'static str,
        declared: usize,
        consumed: usize,
    },

    #[error("{card}: board aggregate declares {declared} words, more than the {capacity} word host buffer")]
    Oversized {
        card: String,
        declared: usize,
        capacity: usize,
    },

    #[error("{card}: frame ran past the end of its enclosing frame ({frame})")]
    Truncated { card: String, frame: &'static str },

    #[error("{card}: received data for disabled {kind} {index}")]
    DisabledChannel {
        card: String,
        kind: &'static str,
        index: usize,
    },

    #[error("{card}: {kind} {index} received {received} samples, expected {expected}")]
    SampleMismatch {
        card: String,
        kind: &'static str,
        index: usize,
        received: usize,
        expected: usize,
    },

    #[error("{card}: received TR{tr} data when not marked for readout (group {group})")]
    UnexpectedTr { card: String, tr: usize, group: usize },

    #[error("{card}: group {group} is missing TR{tr} data")]
    MissingTr { card: String, tr: usize, group: usize },

    #[error("{card}: record buffer for {label} overflowed at {capacity} events")]
    Overflow {
        card: String,
        label: String,
        capacity: usize,
    },

    #[error("{card}: asked to flush {requested} events but {label} only holds {available}")]
    Underrun {
        card: String,
        label: String,
        requested: usize,
        available: usize,
    },
}

/// Settings that fail range or cross-field validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{card}: {field} exceeds {max} (ch {channel})")]
    ChannelRange {
        card: String,
        field: &'static str,
        max: u32,
        channel: usize,
    },

    #[error("{card}: {field} must be at least {min} (ch {channel})")]
    ChannelMinimum {
        card: String,
        field: &'static str,
        min: u32,
        channel: usize,
    },

    #[error("{card}: record length is not the same between pairs (ch {channel})")]
    PairMismatch { card: String, channel: usize },

    #[error("{card}: gate offset and pre_trigger relationship violated (ch {channel})")]
    GateOffset { card: String, channel: usize },

    #[error("{card}: {field} out of range ({value} > {max})")]
    CardRange {
        card: String,
        field: &'static str,
        value: u32,
        max: u32,
    },

    #[error("{card}: expected {expected} {what}, found {found}")]
    Count {
        card: String,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{card}: no channels enabled")]
    NothingEnabled { card: String },

    #[error("run: {0}")]
    Run(String),
}

/// Failures reported by the hardware access layer.
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("{card}: bus error at 0x{address:08x}")]
    Bus { card: String, address: u32 },

    #[error("{card}: register read-back for {register} returned {value}")]
    ReadBack {
        card: String,
        register: &'static str,
        value: u32,
    },

    #[error("{card}: {message}")]
    Other { card: String, message: String },
}

/// Failures writing a flushed cycle to disk.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("dataset {path} has shape {shape:?} but {len} values")]
    Shape {
        path: String,
        shape: Vec<usize>,
        len: usize,
    },
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot {action} while {state:?}")]
    State {
        action: &'static str,
        state: crate::orchestrator::RunState,
    },

    #[error("{0} thread panicked")]
    ThreadPanic(&'static str),
}
