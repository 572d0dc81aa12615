//! # Spectral DAQ Core Library
//!
//! This crate implements a streaming spectral data-acquisition pipeline:
//! time-domain samples are pulled from a triggered digitizer, transformed to
//! frequency-domain spectra, incoherently averaged into power spectra, and
//! handed to downstream consumers, all without data loss and with
//! deterministic backpressure between stages.
//!
//! ## Crate Structure
//!
//! - **`config`**: Strongly-typed configuration loaded from TOML files and
//!   environment variables, with semantic validation before any hardware I/O.
//! - **`data`**: The reusable sample record containers (real time, IQ time,
//!   frequency, power) passed between stages.
//! - **`digitizer`**: The narrow [`digitizer::DigitizerDriver`] trait, the
//!   simulated adapter, and the acquisition stage that owns the DMA buffer
//!   pool and recovers from overruns.
//! - **`dsp`**: The forward and inverse FFT stages and the incoherent power
//!   averager.
//! - **`error`**: The crate-wide [`error::DaqError`] type.
//! - **`pipeline`**: The minimal execution substrate: one dedicated thread
//!   per stage, cancellation, and instruction mailboxes.
//! - **`producer`**: A synthetic record source for debugging without any
//!   digitizer in the loop.
//! - **`sink`**: A counting dead-end consumer; real deployments attach file
//!   writers or relays to the same consumer interface.
//! - **`stream`**: The bounded slot channels stages communicate through,
//!   multiplexing records with the start/run/stop/error/exit signals.
//! - **`trace`**: Logging initialization.

pub mod config;
pub mod data;
pub mod digitizer;
pub mod dsp;
pub mod error;
pub mod pipeline;
pub mod producer;
pub mod sink;
pub mod stream;
pub mod trace;
