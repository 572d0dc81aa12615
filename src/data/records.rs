//! Fixed-capacity sample records.
//!
//! Each record variant is a reusable container for one chunk of pipeline
//! data: raw ADC counts, IQ voltages, complex frequency bins, or averaged
//! power bins. Records are allocated once when a stream channel is built and
//! then cycle between producer and consumer for the life of the channel, so
//! the steady-state data path performs no heap allocation.
//!
//! `allocate` is idempotent: calling it again with the same length is a
//! no-op, while calling it with a different length is an error: a record's
//! buffer length is fixed after first allocation.

use num_complex::Complex;

use crate::error::{AppResult, DaqError};

/// Full-scale count of the 16-bit ADC sample representation.
const ADC_FULL_SCALE: f64 = 65536.0;

fn size_locked(kind: &str, have: usize, want: usize) -> DaqError {
    DaqError::Processing(format!(
        "{kind} record is allocated for {have} elements; cannot re-allocate to {want}"
    ))
}

/// Raw time-domain samples as produced by the digitizer, plus the calibration
/// metadata needed to interpret them.
#[derive(Debug, Clone, Default)]
pub struct RealTimeRecord {
    samples: Vec<u16>,
    dynamic_range: f64,
    chunk_counter: u64,
}

impl RealTimeRecord {
    /// Create a record pre-allocated for `n_samples`.
    pub fn with_len(n_samples: usize) -> Self {
        Self {
            samples: vec![0; n_samples],
            dynamic_range: 0.0,
            chunk_counter: 0,
        }
    }

    /// Allocate the sample array. No-op if already allocated to `n_samples`.
    pub fn allocate(&mut self, n_samples: usize) -> AppResult<()> {
        if self.samples.is_empty() {
            self.samples = vec![0; n_samples];
        } else if self.samples.len() != n_samples {
            return Err(size_locked("real time", self.samples.len(), n_samples));
        }
        Ok(())
    }

    /// Raw ADC counts.
    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    /// Mutable access to the sample array, for the producing stage.
    pub fn samples_mut(&mut self) -> &mut [u16] {
        &mut self.samples
    }

    /// Number of samples the record holds.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if the record has not been allocated.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Full-scale input range in volts (not mV; not a magnitude).
    pub fn dynamic_range(&self) -> f64 {
        self.dynamic_range
    }

    /// Set the full-scale input range in volts.
    pub fn set_dynamic_range(&mut self, volts: f64) {
        self.dynamic_range = volts;
    }

    /// Monotonic chunk sequence number assigned by the producing stage.
    pub fn chunk_counter(&self) -> u64 {
        self.chunk_counter
    }

    /// Set the chunk sequence number.
    pub fn set_chunk_counter(&mut self, counter: u64) {
        self.chunk_counter = counter;
    }

    /// Convert raw counts to volts using the record's dynamic range.
    pub fn as_volts(&self) -> Vec<f64> {
        let range = self.dynamic_range;
        self.samples
            .iter()
            .map(|&raw| (f64::from(raw) * range / ADC_FULL_SCALE) - range / 2.0)
            .collect()
    }
}

/// IQ time-domain samples, naturally in volts rather than ADC counts.
#[derive(Debug, Clone, Default)]
pub struct IqTimeRecord {
    samples: Vec<Complex<f64>>,
    chunk_counter: u64,
}

impl IqTimeRecord {
    /// Create a record pre-allocated for `n_samples`.
    pub fn with_len(n_samples: usize) -> Self {
        Self {
            samples: vec![Complex::default(); n_samples],
            chunk_counter: 0,
        }
    }

    /// Allocate the sample array. No-op if already allocated to `n_samples`.
    pub fn allocate(&mut self, n_samples: usize) -> AppResult<()> {
        if self.samples.is_empty() {
            self.samples = vec![Complex::default(); n_samples];
        } else if self.samples.len() != n_samples {
            return Err(size_locked("IQ time", self.samples.len(), n_samples));
        }
        Ok(())
    }

    /// Complex sample array.
    pub fn samples(&self) -> &[Complex<f64>] {
        &self.samples
    }

    /// Mutable access to the sample array.
    pub fn samples_mut(&mut self) -> &mut [Complex<f64>] {
        &mut self.samples
    }

    /// Number of samples the record holds.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if the record has not been allocated.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Monotonic chunk sequence number.
    pub fn chunk_counter(&self) -> u64 {
        self.chunk_counter
    }

    /// Set the chunk sequence number.
    pub fn set_chunk_counter(&mut self, counter: u64) {
        self.chunk_counter = counter;
    }
}

/// Complex frequency-domain bins plus the scalar metadata describing the band.
#[derive(Debug, Clone, Default)]
pub struct FrequencyRecord {
    bins: Vec<Complex<f64>>,
    bin_width_hz: f64,
    minimum_frequency_hz: f64,
    chunk_counter: u64,
}

impl FrequencyRecord {
    /// Create a record pre-allocated for `n_bins`.
    pub fn with_len(n_bins: usize) -> Self {
        Self {
            bins: vec![Complex::default(); n_bins],
            bin_width_hz: 0.0,
            minimum_frequency_hz: 0.0,
            chunk_counter: 0,
        }
    }

    /// Allocate the bin array. No-op if already allocated to `n_bins`.
    pub fn allocate(&mut self, n_bins: usize) -> AppResult<()> {
        if self.bins.is_empty() {
            self.bins = vec![Complex::default(); n_bins];
        } else if self.bins.len() != n_bins {
            return Err(size_locked("frequency", self.bins.len(), n_bins));
        }
        Ok(())
    }

    /// Complex bin array.
    pub fn bins(&self) -> &[Complex<f64>] {
        &self.bins
    }

    /// Mutable access to the bin array.
    pub fn bins_mut(&mut self) -> &mut [Complex<f64>] {
        &mut self.bins
    }

    /// Number of bins the record holds.
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// True if the record has not been allocated.
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Width of one frequency bin in Hz.
    pub fn bin_width_hz(&self) -> f64 {
        self.bin_width_hz
    }

    /// Set the bin width in Hz.
    pub fn set_bin_width_hz(&mut self, hz: f64) {
        self.bin_width_hz = hz;
    }

    /// Frequency of the first bin in Hz.
    pub fn minimum_frequency_hz(&self) -> f64 {
        self.minimum_frequency_hz
    }

    /// Set the frequency of the first bin in Hz.
    pub fn set_minimum_frequency_hz(&mut self, hz: f64) {
        self.minimum_frequency_hz = hz;
    }

    /// Monotonic chunk sequence number.
    pub fn chunk_counter(&self) -> u64 {
        self.chunk_counter
    }

    /// Set the chunk sequence number.
    pub fn set_chunk_counter(&mut self, counter: u64) {
        self.chunk_counter = counter;
    }
}

/// Incoherently averaged power bins in mW.
#[derive(Debug, Clone, Default)]
pub struct PowerRecord {
    bins: Vec<f64>,
    bin_width_hz: f64,
    minimum_frequency_hz: f64,
    chunk_counter: u64,
}

impl PowerRecord {
    /// Create a record pre-allocated for `n_bins`.
    pub fn with_len(n_bins: usize) -> Self {
        Self {
            bins: vec![0.0; n_bins],
            bin_width_hz: 0.0,
            minimum_frequency_hz: 0.0,
            chunk_counter: 0,
        }
    }

    /// Allocate the bin array. No-op if already allocated to `n_bins`.
    pub fn allocate(&mut self, n_bins: usize) -> AppResult<()> {
        if self.bins.is_empty() {
            self.bins = vec![0.0; n_bins];
        } else if self.bins.len() != n_bins {
            return Err(size_locked("power", self.bins.len(), n_bins));
        }
        Ok(())
    }

    /// Averaged power per bin, in mW.
    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    /// Mutable access to the bin array.
    pub fn bins_mut(&mut self) -> &mut [f64] {
        &mut self.bins
    }

    /// Number of bins the record holds.
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// True if the record has not been allocated.
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Width of one frequency bin in Hz.
    pub fn bin_width_hz(&self) -> f64 {
        self.bin_width_hz
    }

    /// Set the bin width in Hz.
    pub fn set_bin_width_hz(&mut self, hz: f64) {
        self.bin_width_hz = hz;
    }

    /// Frequency of the first bin in Hz.
    pub fn minimum_frequency_hz(&self) -> f64 {
        self.minimum_frequency_hz
    }

    /// Set the frequency of the first bin in Hz.
    pub fn set_minimum_frequency_hz(&mut self, hz: f64) {
        self.minimum_frequency_hz = hz;
    }

    /// Chunk sequence number of the first spectrum in the averaged batch.
    pub fn chunk_counter(&self) -> u64 {
        self.chunk_counter
    }

    /// Set the chunk sequence number.
    pub fn set_chunk_counter(&mut self, counter: u64) {
        self.chunk_counter = counter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_idempotent() {
        let mut record = RealTimeRecord::default();
        record.allocate(1024).unwrap();
        assert_eq!(record.len(), 1024);
        record.allocate(1024).unwrap();
        assert_eq!(record.len(), 1024);
    }

    #[test]
    fn reallocating_to_a_different_length_is_an_error() {
        let mut record = FrequencyRecord::with_len(512);
        assert!(record.allocate(512).is_ok());
        assert!(record.allocate(1024).is_err());
        assert_eq!(record.len(), 512);
    }

    #[test]
    fn as_volts_spans_the_dynamic_range() {
        let mut record = RealTimeRecord::with_len(3);
        record.set_dynamic_range(0.4);
        record.samples_mut().copy_from_slice(&[0, 32768, 65535]);

        let volts = record.as_volts();
        assert!((volts[0] - (-0.2)).abs() < 1e-12);
        assert!(volts[1].abs() < 1e-5);
        assert!((volts[2] - 0.2).abs() < 1e-5);
    }

    #[test]
    fn metadata_round_trips() {
        let mut record = PowerRecord::with_len(8);
        record.set_bin_width_hz(21972.65625);
        record.set_minimum_frequency_hz(1.0e6);
        record.set_chunk_counter(17);
        assert_eq!(record.bin_width_hz(), 21972.65625);
        assert_eq!(record.minimum_frequency_hz(), 1.0e6);
        assert_eq!(record.chunk_counter(), 17);
    }
}
