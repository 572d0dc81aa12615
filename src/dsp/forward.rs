//! Forward spectral transform stage.
//!
//! Consumes real or IQ time records, runs a forward FFT, and emits frequency
//! records. Real input is converted from ADC counts to volts (using each
//! record's dynamic-range metadata) before transforming, and a contiguous
//! output sub-band can be selected around a target frequency. Complex input
//! is emitted in full, unfolded so that negative frequencies precede
//! positive frequencies.

use std::sync::Arc;
use std::time::Duration;

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tracing::{debug, info, warn};

use crate::config::{TransformConfig, TransformInput};
use crate::data::{FrequencyRecord, IqTimeRecord, RealTimeRecord};
use crate::error::{AppResult, DaqError};
use crate::pipeline::{PipelineStage, StageContext};
use crate::stream::{Polled, StreamConsumer, StreamProducer, StreamSignal};

use super::fft_normalization;

/// Input poll timeout; bounds how long a quiet channel delays the
/// instruction and cancellation checks.
const POLL: Duration = Duration::from_millis(20);

/// The time-domain stream this stage consumes, matching `input-type`.
pub enum TransformSource {
    /// Raw digitizer records (`input-type = "real"`).
    Real(StreamConsumer<RealTimeRecord>),
    /// IQ records (`input-type = "complex"`).
    Iq(StreamConsumer<IqTimeRecord>),
}

enum Arrived {
    Nothing,
    Signal(StreamSignal),
    Spectrum { chunk: u64 },
    Disconnected,
}

/// Pipeline stage executing the forward FFT.
pub struct FrequencyTransform {
    config: TransformConfig,
    samples_per_sec: f64,
    input: TransformSource,
    output: StreamProducer<FrequencyRecord>,
    plan: Option<Arc<dyn Fft<f64>>>,
    scratch: Vec<Complex<f64>>,
}

impl FrequencyTransform {
    /// Create the stage. `samples_per_sec` is the effective sample rate of
    /// the incoming time records.
    pub fn new(
        config: TransformConfig,
        samples_per_sec: f64,
        input: TransformSource,
        output: StreamProducer<FrequencyRecord>,
    ) -> Self {
        Self {
            config,
            samples_per_sec,
            input,
            output,
            plan: None,
            scratch: Vec::new(),
        }
    }

    /// Width of one output bin in Hz.
    pub fn bin_width_hz(&self) -> f64 {
        (self.samples_per_sec / 2.0) / self.config.fft_size as f64
    }

    /// Number of bins emitted per record.
    pub fn num_output_bins(&self) -> usize {
        let mut bins = self.config.fft_size;
        if self.config.min_output_bandwidth > 0.0 {
            bins = (self.config.min_output_bandwidth / self.bin_width_hz()).ceil() as usize;
        }
        bins.min(self.config.fft_size)
    }

    /// Index of the first emitted bin.
    ///
    /// With a target frequency configured, the sub-band is centered on the
    /// bin containing the target; with an even bin count the band shifts one
    /// bin toward the upper half when the target lies in the upper half of
    /// its bin.
    pub fn first_output_index(&self) -> usize {
        let bin_width = self.bin_width_hz();
        let mut center_bin = ((self.config.fft_size - 1) / 2) + 1;
        if self.config.freq_in_center_bin > 0.0 {
            center_bin = (self.config.freq_in_center_bin / bin_width) as usize;
        }
        let bins = self.num_output_bins();
        let mut first = center_bin.saturating_sub(bins / 2);
        if bins % 2 == 0
            && (self.config.freq_in_center_bin - (bins / 2) as f64 * bin_width) > bin_width / 2.0
        {
            first += 1;
        }
        first
    }

    /// Frequency of the first emitted bin in Hz.
    pub fn min_output_frequency(&self) -> f64 {
        self.first_output_index() as f64 * self.bin_width_hz()
    }

    fn sub_band_configured(&self) -> bool {
        self.config.freq_in_center_bin > 0.0 || self.config.min_output_bandwidth > 0.0
    }

    /// Transform the staged samples and emit one frequency record.
    fn transform_and_emit(&mut self, chunk: u64, ctx: &StageContext) -> AppResult<()> {
        let plan = match &self.plan {
            Some(plan) => Arc::clone(plan),
            None => {
                return Err(DaqError::Processing(
                    "forward transform plan not initialized".to_string(),
                ));
            }
        };
        plan.process(&mut self.scratch);

        let norm = fft_normalization(self.config.fft_size);
        for bin in &mut self.scratch {
            *bin *= norm;
        }

        let bin_width = self.bin_width_hz();
        let min_frequency = self.min_output_frequency();
        let first = self.first_output_index();
        let n_bins = self.num_output_bins();
        let fft_size = self.config.fft_size;
        let input_type = self.config.input_type;

        let scratch = &self.scratch;
        let cancel = ctx.cancel_token();
        let sent = self.output.send_record(cancel, |record| {
            if record.is_empty() {
                let _ = record.allocate(match input_type {
                    TransformInput::Real => n_bins,
                    TransformInput::Complex => fft_size,
                });
            }
            match input_type {
                TransformInput::Real => {
                    record
                        .bins_mut()
                        .copy_from_slice(&scratch[first..first + n_bins]);
                }
                TransformInput::Complex => {
                    // Unfold so negative frequencies precede positive ones.
                    let half = (fft_size + 1) / 2;
                    let tail = fft_size - half;
                    record.bins_mut()[..tail].copy_from_slice(&scratch[half..]);
                    record.bins_mut()[tail..].copy_from_slice(&scratch[..half]);
                }
            }
            record.set_bin_width_hz(bin_width);
            record.set_minimum_frequency_hz(min_frequency);
            record.set_chunk_counter(chunk);
        });
        match sent {
            Ok(()) => Ok(()),
            // Cancellation mid-emit drops the in-flight spectrum; the loop
            // exits at its next iteration.
            Err(err) if err.is_cancellation() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn propagate(&mut self, signal: StreamSignal, ctx: &StageContext) -> AppResult<()> {
        match self.output.send_signal(signal, ctx.cancel_token()) {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancellation() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl PipelineStage for FrequencyTransform {
    fn name(&self) -> &'static str {
        "frequency-transform"
    }

    fn initialize(&mut self) -> AppResult<()> {
        let fft_size = self.config.fft_size;
        match (&self.input, self.config.input_type) {
            (TransformSource::Real(_), TransformInput::Real)
            | (TransformSource::Iq(_), TransformInput::Complex) => {}
            _ => {
                return Err(DaqError::Configuration(
                    "input-type does not match the wired input stream".to_string(),
                ));
            }
        }
        if self.config.input_type == TransformInput::Complex && self.sub_band_configured() {
            return Err(DaqError::Configuration(
                "sub-band selection (freq-in-center-bin / min-output-bandwidth) \
                 requires input-type = \"real\""
                    .to_string(),
            ));
        }

        if self.config.use_wisdom {
            // The FFT backend caches plans in memory per (size, direction);
            // a plan cache file is accepted but not required.
            debug!(path = ?self.config.plan_cache_path, "plan cache requested; using in-memory planner cache");
        }
        let mut planner = FftPlanner::new();
        self.plan = Some(planner.plan_fft_forward(fft_size));
        self.scratch = vec![Complex::default(); fft_size];
        debug!(
            fft_size,
            flag = %self.config.transform_flag,
            bin_width_hz = self.bin_width_hz(),
            output_bins = self.num_output_bins(),
            "forward transform plan ready"
        );
        Ok(())
    }

    fn execute(&mut self, ctx: &mut StageContext) -> AppResult<()> {
        info!("starting main loop (frequency transform)");
        while !ctx.is_canceled() {
            if let Some(instruction) = ctx.latest_instruction() {
                debug!(?instruction, "no instructions supported; ignored");
            }

            // Poll and stage the input samples; the slot is released before
            // the transform runs.
            let arrived = {
                let Self { input, scratch, .. } = self;
                match input {
                    TransformSource::Real(rx) => match rx.poll(POLL) {
                        Polled::Record(record) => {
                            if record.len() != scratch.len() {
                                warn!(
                                    got = record.len(),
                                    want = scratch.len(),
                                    "dropping real record of unexpected length"
                                );
                                Arrived::Nothing
                            } else {
                                for (slot, volts) in scratch.iter_mut().zip(record.as_volts()) {
                                    *slot = Complex::new(volts, 0.0);
                                }
                                Arrived::Spectrum {
                                    chunk: record.chunk_counter(),
                                }
                            }
                        }
                        Polled::Signal(signal) => Arrived::Signal(signal),
                        Polled::Pending => Arrived::Nothing,
                        Polled::Disconnected => Arrived::Disconnected,
                    },
                    TransformSource::Iq(rx) => match rx.poll(POLL) {
                        Polled::Record(record) => {
                            if record.len() != scratch.len() {
                                warn!(
                                    got = record.len(),
                                    want = scratch.len(),
                                    "dropping IQ record of unexpected length"
                                );
                                Arrived::Nothing
                            } else {
                                scratch.copy_from_slice(record.samples());
                                Arrived::Spectrum {
                                    chunk: record.chunk_counter(),
                                }
                            }
                        }
                        Polled::Signal(signal) => Arrived::Signal(signal),
                        Polled::Pending => Arrived::Nothing,
                        Polled::Disconnected => Arrived::Disconnected,
                    },
                }
            };

            match arrived {
                Arrived::Nothing => {}
                Arrived::Spectrum { chunk } => self.transform_and_emit(chunk, ctx)?,
                Arrived::Signal(StreamSignal::Start) => {
                    debug!("session start");
                    self.propagate(StreamSignal::Start, ctx)?;
                }
                Arrived::Signal(StreamSignal::Stop) => {
                    debug!("session stop");
                    self.propagate(StreamSignal::Stop, ctx)?;
                }
                Arrived::Signal(StreamSignal::Error) => {
                    warn!("upstream error; propagating and shutting down");
                    let _ = self
                        .output
                        .send_signal(StreamSignal::Error, ctx.cancel_token());
                    break;
                }
                Arrived::Signal(StreamSignal::Exit) | Arrived::Disconnected => break,
                Arrived::Signal(StreamSignal::Run) => {
                    // `run` always arrives with a record.
                    warn!("bare run signal without a record; dropped");
                }
            }
        }

        info!("frequency transform exiting");
        let _ = self
            .output
            .send_signal(StreamSignal::Stop, ctx.cancel_token());
        let _ = self
            .output
            .send_signal(StreamSignal::Exit, ctx.cancel_token());
        Ok(())
    }

    fn finalize(&mut self) {
        // Plans are reused for the whole session and dropped only here.
        self.plan = None;
        self.scratch = Vec::new();
    }
}
