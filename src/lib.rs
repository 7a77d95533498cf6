//! Data acquisition for CAEN V1730 (DPP-PSD) and V1742 (DRS4) digitizers
//!
//! A readout thread block-transfers raw frames from every card into a
//! [`buffer::RawByteBuffer`]. A decode thread turns complete frames into
//! per-channel records in a [`store::RecordStore`] and writes them out in
//! cycles decided by a [`policy::RunCyclePolicy`]. [`orchestrator::Acquisition`]
//! ties the two together.

pub mod args;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod decoder;
pub mod digitizer;
pub mod error;
pub mod exfil;
pub mod monitoring;
pub mod orchestrator;
pub mod policy;
pub mod settings;
pub mod sim;
pub mod sink;
pub mod store;

pub use error::{DaqError, DaqResult};
