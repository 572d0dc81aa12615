//! Incoherent power averager stage.
//!
//! Consumes frequency records and accumulates per-bin power over a
//! configurable batch size. Power is converted to physical units as it is
//! accumulated: magnitude-squared peak volts across the 50 Ω termination,
//! peak-to-RMS corrected, in mW. A batch cut short by `stop` is rescaled by
//! `num_to_average / count` before emission, so emitted values are
//! scale-invariant to the batch size.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AveragerConfig;
use crate::data::{FrequencyRecord, PowerRecord};
use crate::error::AppResult;
use crate::pipeline::{PipelineStage, StageContext};
use crate::stream::{Polled, StreamConsumer, StreamProducer, StreamSignal};

const POLL: Duration = Duration::from_millis(20);

/// mW per W; spectra are reported in mW.
const MILLIWATTS_PER_WATT: f64 = 1000.0;
/// Termination impedance the bin voltages are developed across.
const LOAD_IMPEDANCE_OHMS: f64 = 50.0;
/// Peak-amplitude to mean-square conversion for sinusoidal bins.
const PEAK_TO_MEAN_SQUARE: f64 = 2.0;

/// Batch metadata captured from the first spectrum of each batch.
#[derive(Debug, Clone, Copy, Default)]
struct BatchScalars {
    bin_width_hz: f64,
    minimum_frequency_hz: f64,
    chunk_counter: u64,
}

/// Pipeline stage averaging spectral power incoherently.
pub struct PowerAverager {
    config: AveragerConfig,
    input: StreamConsumer<FrequencyRecord>,
    output: StreamProducer<PowerRecord>,
    accumulator: Vec<f64>,
    count: usize,
    batch: BatchScalars,
    scratch: FrequencyRecord,
}

impl PowerAverager {
    /// Create the stage.
    pub fn new(
        config: AveragerConfig,
        input: StreamConsumer<FrequencyRecord>,
        output: StreamProducer<PowerRecord>,
    ) -> Self {
        Self {
            config,
            input,
            output,
            accumulator: Vec::new(),
            count: 0,
            batch: BatchScalars::default(),
            scratch: FrequencyRecord::default(),
        }
    }

    fn reset_accumulator(&mut self) {
        for bin in &mut self.accumulator {
            *bin = 0.0;
        }
        self.count = 0;
    }

    /// Fold one spectrum into the running average; emit when the batch is
    /// complete.
    fn accumulate(&mut self, record: &FrequencyRecord, ctx: &StageContext) -> AppResult<()> {
        if self.count == 0 {
            self.batch = BatchScalars {
                bin_width_hz: record.bin_width_hz(),
                minimum_frequency_hz: record.minimum_frequency_hz(),
                chunk_counter: record.chunk_counter(),
            };
        }
        let weight = 1.0 / self.config.num_to_average as f64;
        for (sum, bin) in self.accumulator.iter_mut().zip(record.bins()) {
            let power_mw =
                bin.norm_sqr() * MILLIWATTS_PER_WATT / LOAD_IMPEDANCE_OHMS / PEAK_TO_MEAN_SQUARE;
            *sum += power_mw * weight;
        }
        self.count += 1;

        if self.count == self.config.num_to_average {
            self.emit(1.0, ctx)?;
            self.reset_accumulator();
        }
        Ok(())
    }

    /// Flush a partial batch on `stop`, rescaled to be batch-size invariant.
    fn flush_partial(&mut self, ctx: &StageContext) -> AppResult<()> {
        if self.count > 0 {
            let rescale = self.config.num_to_average as f64 / self.count as f64;
            debug!(
                accumulated = self.count,
                rescale, "flushing partial average batch"
            );
            self.emit(rescale, ctx)?;
            self.reset_accumulator();
        }
        Ok(())
    }

    fn emit(&mut self, scale: f64, ctx: &StageContext) -> AppResult<()> {
        let accumulator = &self.accumulator;
        let batch = self.batch;
        let n_bins = self.config.spectrum_size;
        let sent = self.output.send_record(ctx.cancel_token(), |record| {
            if record.is_empty() {
                let _ = record.allocate(n_bins);
            }
            for (out, sum) in record.bins_mut().iter_mut().zip(accumulator) {
                *out = sum * scale;
            }
            record.set_bin_width_hz(batch.bin_width_hz);
            record.set_minimum_frequency_hz(batch.minimum_frequency_hz);
            record.set_chunk_counter(batch.chunk_counter);
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

impl PipelineStage for PowerAverager {
    fn name(&self) -> &'static str {
        "power-averager"
    }

    fn initialize(&mut self) -> AppResult<()> {
        self.accumulator = vec![0.0; self.config.spectrum_size];
        self.count = 0;
        debug!(
            spectrum_size = self.config.spectrum_size,
            num_to_average = self.config.num_to_average,
            "power averager ready"
        );
        Ok(())
    }

    fn execute(&mut self, ctx: &mut StageContext) -> AppResult<()> {
        info!("starting main loop (power averager)");
        while !ctx.is_canceled() {
            if let Some(instruction) = ctx.latest_instruction() {
                debug!(?instruction, "no instructions supported; ignored");
            }

            // Copy the slot into the reusable scratch record so the slot is
            // released before the (potentially blocking) emit below.
            let staged = {
                let Self {
                    input,
                    accumulator,
                    scratch,
                    ..
                } = self;
                match input.poll(POLL) {
                    Polled::Record(record) => {
                        if record.len() != accumulator.len() {
                            warn!(
                                got = record.len(),
                                want = accumulator.len(),
                                "dropping spectrum of unexpected length"
                            );
                            None
                        } else {
                            if scratch.is_empty() {
                                let _ = scratch.allocate(record.len());
                            }
                            scratch.bins_mut().copy_from_slice(record.bins());
                            scratch.set_bin_width_hz(record.bin_width_hz());
                            scratch.set_minimum_frequency_hz(record.minimum_frequency_hz());
                            scratch.set_chunk_counter(record.chunk_counter());
                            Some(Ok(()))
                        }
                    }
                    Polled::Signal(signal) => Some(Err(signal)),
                    Polled::Pending => None,
                    Polled::Disconnected => Some(Err(StreamSignal::Exit)),
                }
            };

            match staged {
                None => {}
                Some(Ok(())) => {
                    let spectrum = std::mem::take(&mut self.scratch);
                    self.accumulate(&spectrum, ctx)?;
                    self.scratch = spectrum;
                }
                Some(Err(StreamSignal::Start)) => {
                    debug!("session start; accumulator reset");
                    self.reset_accumulator();
                    self.propagate(StreamSignal::Start, ctx)?;
                }
                Some(Err(StreamSignal::Stop)) => {
                    self.flush_partial(ctx)?;
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

        info!("power averager exiting");
        let _ = self
            .output
            .send_signal(StreamSignal::Stop, ctx.cancel_token());
        let _ = self
            .output
            .send_signal(StreamSignal::Exit, ctx.cancel_token());
        Ok(())
    }

    fn finalize(&mut self) {
        self.accumulator = Vec::new();
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_context;
    use crate::stream::stream_channel;
    use num_complex::Complex;

    fn averager_with(
        num_to_average: usize,
        spectrum_size: usize,
    ) -> (
        PowerAverager,
        StreamProducer<FrequencyRecord>,
        StreamConsumer<PowerRecord>,
    ) {
        let config = AveragerConfig {
            num_to_average,
            spectrum_size,
            stream_slots: 8,
        };
        let (freq_tx, freq_rx) = stream_channel(8, FrequencyRecord::default);
        let (power_tx, power_rx) = stream_channel(8, PowerRecord::default);
        let stage = PowerAverager::new(config, freq_rx, power_tx);
        (stage, freq_tx, power_rx)
    }

    fn spectrum(bins: &[Complex<f64>], chunk: u64) -> FrequencyRecord {
        let mut record = FrequencyRecord::with_len(bins.len());
        record.bins_mut().copy_from_slice(bins);
        record.set_bin_width_hz(1000.0);
        record.set_minimum_frequency_hz(5000.0);
        record.set_chunk_counter(chunk);
        record
    }

    #[test]
    fn power_conversion_uses_milliwatts_into_fifty_ohms() {
        let (mut stage, _tx, mut rx) = averager_with(1, 2);
        stage.initialize().unwrap();
        let (ctx, _ix) = test_context();

        // 1 V peak in bin 0: (1 V)^2 / 2 / 50 Ω = 10 mW.
        let record = spectrum(&[Complex::new(1.0, 0.0), Complex::new(0.0, 0.0)], 3);
        stage.accumulate(&record, &ctx).unwrap();

        match rx.poll(Duration::from_millis(100)) {
            Polled::Record(power) => {
                assert!((power.bins()[0] - 10.0).abs() < 1.0e-12);
                assert_eq!(power.bins()[1], 0.0);
                assert_eq!(power.bin_width_hz(), 1000.0);
                assert_eq!(power.minimum_frequency_hz(), 5000.0);
                assert_eq!(power.chunk_counter(), 3);
            }
            _ => panic!("expected a power record"),
        };
    }

    #[test]
    fn batch_emits_after_num_to_average_spectra() {
        let (mut stage, _tx, mut rx) = averager_with(4, 1);
        stage.initialize().unwrap();
        let (ctx, _ix) = test_context();

        for chunk in 0..7u64 {
            let record = spectrum(&[Complex::new(2.0, 0.0)], chunk);
            stage.accumulate(&record, &ctx).unwrap();
        }

        // One full batch emitted (chunks 0-3); chunks 4-6 still accumulating.
        match rx.poll(Duration::from_millis(100)) {
            Polled::Record(power) => {
                // |2|^2 * 1000 / 50 / 2 = 40 mW, identical every spectrum.
                assert!((power.bins()[0] - 40.0).abs() < 1.0e-12);
                assert_eq!(power.chunk_counter(), 0);
            }
            _ => panic!("expected one full batch"),
        }
        assert!(matches!(
            rx.poll(Duration::from_millis(5)),
            Polled::Pending
        ));
        assert_eq!(stage.count, 3);
    }

    #[test]
    fn partial_batch_rescale_matches_full_batch() {
        let bins = [Complex::new(0.3, -0.4), Complex::new(-1.2, 0.5)];

        // Full batch of 4 identical spectra.
        let (mut full, _tx_a, mut rx_a) = averager_with(4, 2);
        full.initialize().unwrap();
        let (ctx_a, _ia) = test_context();
        for chunk in 0..4u64 {
            full.accumulate(&spectrum(&bins, chunk), &ctx_a).unwrap();
        }
        let full_bins: Vec<f64> = match rx_a.poll(Duration::from_millis(100)) {
            Polled::Record(power) => power.bins().to_vec(),
            _ => panic!("expected the full batch"),
        };

        // The same spectra as partial batches of 1 and 3, each flushed.
        let (mut partial, _tx_b, mut rx_b) = averager_with(4, 2);
        partial.initialize().unwrap();
        let (ctx_b, _ib) = test_context();

        partial.accumulate(&spectrum(&bins, 0), &ctx_b).unwrap();
        partial.flush_partial(&ctx_b).unwrap();
        for chunk in 1..4u64 {
            partial.accumulate(&spectrum(&bins, chunk), &ctx_b).unwrap();
        }
        partial.flush_partial(&ctx_b).unwrap();

        for _ in 0..2 {
            match rx_b.poll(Duration::from_millis(100)) {
                Polled::Record(power) => {
                    for (got, want) in power.bins().iter().zip(&full_bins) {
                        assert!(
                            (got - want).abs() < 1.0e-12,
                            "partial batch {got} differs from full batch {want}"
                        );
                    }
                }
                _ => panic!("expected a rescaled partial batch"),
            }
        }
    }

    #[test]
    fn start_resets_a_half_filled_accumulator() {
        let (mut stage, mut tx, mut rx) = averager_with(2, 1);
        stage.initialize().unwrap();
        let (mut ctx, _ix) = test_context();
        let cancel = ctx.cancel_token().clone();

        // Half a batch, then a new session, then a full batch: the stale
        // half must not leak into the new session's average.
        tx.send_record(&cancel, |r| {
            let _ = r.allocate(1);
            r.bins_mut()[0] = Complex::new(9.0, 0.0);
        })
        .unwrap();
        tx.send_signal(StreamSignal::Start, &cancel).unwrap();
        for _ in 0..2 {
            tx.send_record(&cancel, |r| {
                let _ = r.allocate(1);
                r.bins_mut()[0] = Complex::new(1.0, 0.0);
            })
            .unwrap();
        }
        tx.send_signal(StreamSignal::Exit, &cancel).unwrap();

        stage.execute(&mut ctx).unwrap();

        let mut emitted = Vec::new();
        loop {
            match rx.poll(Duration::from_millis(5)) {
                Polled::Record(power) => emitted.push(power.bins()[0]),
                Polled::Signal(_) => {}
                Polled::Pending | Polled::Disconnected => break,
            }
        }
        assert_eq!(emitted.len(), 1);
        assert!((emitted[0] - 10.0).abs() < 1.0e-12);
    }
}
