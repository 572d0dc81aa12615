//! Inverse spectral transform stage.
//!
//! The symmetric counterpart of the forward transform: consumes frequency
//! records, runs an inverse FFT with the same unitary normalization, and
//! emits IQ time records. Used for loop-back testing and for re-examining a
//! band in the time domain.

use std::sync::Arc;
use std::time::Duration;

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tracing::{debug, info, warn};

use crate::data::{FrequencyRecord, IqTimeRecord};
use crate::error::{AppResult, DaqError};
use crate::pipeline::{PipelineStage, StageContext};
use crate::stream::{Polled, StreamConsumer, StreamProducer, StreamSignal};

use super::fft_normalization;

const POLL: Duration = Duration::from_millis(20);

/// Pipeline stage executing the inverse FFT.
pub struct InverseFrequencyTransform {
    fft_size: usize,
    input: StreamConsumer<FrequencyRecord>,
    output: StreamProducer<IqTimeRecord>,
    plan: Option<Arc<dyn Fft<f64>>>,
    scratch: Vec<Complex<f64>>,
}

impl InverseFrequencyTransform {
    /// Create the stage for `fft_size`-point records.
    pub fn new(
        fft_size: usize,
        input: StreamConsumer<FrequencyRecord>,
        output: StreamProducer<IqTimeRecord>,
    ) -> Self {
        Self {
            fft_size,
            input,
            output,
            plan: None,
            scratch: Vec::new(),
        }
    }

    fn invert_and_emit(&mut self, chunk: u64, ctx: &StageContext) -> AppResult<()> {
        let plan = match &self.plan {
            Some(plan) => Arc::clone(plan),
            None => {
                return Err(DaqError::Processing(
                    "inverse transform plan not initialized".to_string(),
                ));
            }
        };
        plan.process(&mut self.scratch);

        let norm = fft_normalization(self.fft_size);
        for sample in &mut self.scratch {
            *sample *= norm;
        }

        let fft_size = self.fft_size;
        let scratch = &self.scratch;
        let sent = self.output.send_record(ctx.cancel_token(), |record| {
            if record.is_empty() {
                let _ = record.allocate(fft_size);
            }
            record.samples_mut().copy_from_slice(scratch);
            record.set_chunk_counter(chunk);
        });
        match sent {
            Ok(()) => Ok(()),
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

impl PipelineStage for InverseFrequencyTransform {
    fn name(&self) -> &'static str {
        "inverse-frequency-transform"
    }

    fn initialize(&mut self) -> AppResult<()> {
        if self.fft_size == 0 {
            return Err(DaqError::Configuration(
                "inverse transform fft-size must be positive".to_string(),
            ));
        }
        let mut planner = FftPlanner::new();
        self.plan = Some(planner.plan_fft_inverse(self.fft_size));
        self.scratch = vec![Complex::default(); self.fft_size];
        debug!(fft_size = self.fft_size, "inverse transform plan ready");
        Ok(())
    }

    fn execute(&mut self, ctx: &mut StageContext) -> AppResult<()> {
        info!("starting main loop (inverse frequency transform)");
        while !ctx.is_canceled() {
            if let Some(instruction) = ctx.latest_instruction() {
                debug!(?instruction, "no instructions supported; ignored");
            }

            let staged = {
                let Self { input, scratch, .. } = self;
                match input.poll(POLL) {
                    Polled::Record(record) => {
                        if record.len() != scratch.len() {
                            warn!(
                                got = record.len(),
                                want = scratch.len(),
                                "dropping frequency record of unexpected length"
                            );
                            None
                        } else {
                            scratch.copy_from_slice(record.bins());
                            Some(Ok(record.chunk_counter()))
                        }
                    }
                    Polled::Signal(signal) => Some(Err(signal)),
                    Polled::Pending => None,
                    Polled::Disconnected => Some(Err(StreamSignal::Exit)),
                }
            };

            match staged {
                None => {}
                Some(Ok(chunk)) => self.invert_and_emit(chunk, ctx)?,
                Some(Err(StreamSignal::Start)) => {
                    debug!("session start");
                    self.propagate(StreamSignal::Start, ctx)?;
                }
                Some(Err(StreamSignal::Stop)) => {
                    debug!("session stop");
                    self.propagate(StreamSignal::Stop, ctx)?;
                }
                Some(Err(StreamSignal::Error)) => {
                    warn!("upstream error; propagating and shutting down");
                    let _ = self
                        .output
                        .send_signal(StreamSignal::Error, ctx.cancel_token());
                    break;
                }
                Some(Err(StreamSignal::Exit)) => break,
                Some(Err(StreamSignal::Run)) => {
                    warn!("bare run signal without a record; dropped");
                }
            }
        }

        info!("inverse frequency transform exiting");
        let _ = self
            .output
            .send_signal(StreamSignal::Stop, ctx.cancel_token());
        let _ = self
            .output
            .send_signal(StreamSignal::Exit, ctx.cancel_token());
        Ok(())
    }

    fn finalize(&mut self) {
        self.plan = None;
        self.scratch = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformConfig;
    use crate::data::RealTimeRecord;
    use crate::dsp::forward::{FrequencyTransform, TransformSource};
    use crate::pipeline::test_context;
    use crate::stream::stream_channel;

    /// Forward then inverse on a synthetic sinusoid reconstructs the time
    /// series up to the unitary normalization round trip.
    #[test]
    fn forward_inverse_round_trip_reconstructs_the_sinusoid() {
        let fft_size = 1024usize;
        let sample_rate = 1_024_000.0;
        let dynamic_range = 0.4f64;
        let tone_hz = 16.0 * sample_rate / fft_size as f64;

        let mut config = TransformConfig::default();
        config.fft_size = fft_size;

        let (mut time_tx, time_rx) = stream_channel(4, RealTimeRecord::default);
        let (freq_tx, freq_rx) = stream_channel(4, FrequencyRecord::default);
        let (iq_tx, mut iq_rx) = stream_channel(4, IqTimeRecord::default);

        let mut forward =
            FrequencyTransform::new(config, sample_rate, TransformSource::Real(time_rx), freq_tx);
        let mut inverse = InverseFrequencyTransform::new(fft_size, freq_rx, iq_tx);

        let (mut forward_ctx, _fi) = test_context();
        let (mut inverse_ctx, _ii) = test_context();
        let forward_cancel = forward_ctx.cancel_token().clone();
        let inverse_cancel = inverse_ctx.cancel_token().clone();

        let forward_thread = std::thread::spawn(move || {
            forward.initialize().unwrap();
            forward.execute(&mut forward_ctx).unwrap();
        });
        let inverse_thread = std::thread::spawn(move || {
            inverse.initialize().unwrap();
            inverse.execute(&mut inverse_ctx).unwrap();
        });

        // The raw counts the digitizer would deliver, kept for comparison.
        let raw: Vec<u16> = (0..fft_size)
            .map(|i| {
                let t = i as f64 / sample_rate;
                let volts = 0.12 * (std::f64::consts::TAU * tone_hz * t).sin();
                (((volts / dynamic_range) + 0.5) * 65535.0) as u16
            })
            .collect();
        let expected: Vec<f64> = raw
            .iter()
            .map(|&r| (f64::from(r) * dynamic_range / 65536.0) - dynamic_range / 2.0)
            .collect();

        let cancel = crate::pipeline::CancelToken::new();
        time_tx
            .send_signal(StreamSignal::Start, &cancel)
            .unwrap();
        time_tx
            .send_record(&cancel, |record| {
                let _ = record.allocate(fft_size);
                record.set_dynamic_range(dynamic_range);
                record.set_chunk_counter(7);
                record.samples_mut().copy_from_slice(&raw);
            })
            .unwrap();

        let deadline = Duration::from_secs(5);
        match iq_rx.poll(deadline) {
            Polled::Signal(StreamSignal::Start) => {}
            _ => panic!("expected start to propagate through both stages"),
        }
        match iq_rx.poll(deadline) {
            Polled::Record(record) => {
                assert_eq!(record.len(), fft_size);
                assert_eq!(record.chunk_counter(), 7);
                let tolerance = 1.0e-6 * dynamic_range;
                for (sample, want) in record.samples().iter().zip(&expected) {
                    assert!(
                        (sample.re - want).abs() < tolerance,
                        "re {} vs {}",
                        sample.re,
                        want
                    );
                    assert!(sample.im.abs() < tolerance, "im {}", sample.im);
                }
            }
            _ => panic!("expected the reconstructed IQ record"),
        }

        forward_cancel.cancel();
        inverse_cancel.cancel();
        forward_thread.join().unwrap();
        inverse_thread.join().unwrap();
    }

    #[test]
    fn zero_fft_size_is_a_configuration_error() {
        let (_freq_tx, freq_rx) = stream_channel(2, FrequencyRecord::default);
        let (iq_tx, _iq_rx) = stream_channel(2, IqTimeRecord::default);
        let mut stage = InverseFrequencyTransform::new(0, freq_rx, iq_tx);
        assert!(matches!(
            stage.initialize(),
            Err(DaqError::Configuration(_))
        ));
    }
}
