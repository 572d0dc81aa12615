//! Spectral processing stages: forward transform, inverse transform, and
//! incoherent power averaging.
//!
//! All three stages share the same shape: poll the input stream, react to
//! control signals, process `run` records through a cached transform plan or
//! accumulator, and emit results downstream with the input's chunk counter
//! preserved. Transform plans come from the `rustfft` planner, which caches
//! plans per (size, direction) so the construction cost is paid once per
//! shape for the life of the stage.

pub mod averager;
pub mod forward;
pub mod inverse;

pub use averager::PowerAverager;
pub use forward::{FrequencyTransform, TransformSource};
pub use inverse::InverseFrequencyTransform;

/// Unitary FFT normalization: every bin of an `n`-point transform is scaled
/// by `sqrt(1/n)` in both directions. Fixed calibration convention.
pub(crate) fn fft_normalization(fft_size: usize) -> f64 {
    (1.0 / fft_size as f64).sqrt()
}
