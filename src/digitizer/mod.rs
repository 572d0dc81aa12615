//! Digitizer driver abstraction.
//!
//! The acquisition stage never talks to vendor SDK globals directly; it goes
//! through the narrow [`DigitizerDriver`] trait. The crate ships one
//! implementation, [`mock::SimulatedDigitizer`], which synthesizes triggered
//! capture data for tests and demos. A hardware-backed adapter implements the
//! same five calls against the vendor SDK.
//!
//! Physical sample rates and input ranges map to opaque device register
//! codes. The two lookup tables are built once; the only property they carry
//! is that each supported physical value maps to exactly one code.

pub mod acquisition;
pub mod mock;

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use acquisition::AcquisitionManager;

/// Driver failure classes.
///
/// `Overrun` is the one condition the acquisition stage handles locally via
/// its drain-and-restart procedure; everything else is fatal to the stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The board ran out of posted-buffer capacity.
    #[error("DMA buffer queue overrun")]
    Overrun,

    /// No buffer completed within the wait deadline; the hardware has
    /// stopped triggering.
    #[error("timed out waiting for a posted buffer to complete")]
    Timeout,

    /// Any other driver failure, with the underlying driver text.
    #[error("driver fault: {0}")]
    Fault(String),
}

/// Identifies one DMA buffer in the acquisition stage's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(usize);

impl BufferHandle {
    /// Handle for the pool buffer at `index`.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Pool index of the buffer this handle names.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Trigger edge selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSlope {
    /// Trigger on a rising edge.
    #[default]
    Rising,
    /// Trigger on a falling edge.
    Falling,
}

/// Trigger configuration handed to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TriggerParams {
    /// Trigger threshold in volts.
    pub level_volts: f64,
    /// Edge to trigger on.
    pub slope: TriggerSlope,
}

impl Default for TriggerParams {
    fn default() -> Self {
        Self {
            level_volts: 0.0,
            slope: TriggerSlope::Rising,
        }
    }
}

/// Capture session parameters passed to [`DigitizerDriver::configure`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureParams {
    /// Sample clock in samples per second (before decimation).
    pub sample_rate: f64,
    /// Full-scale input range in volts.
    pub input_range_volts: f64,
    /// Trigger settings.
    pub trigger: TriggerParams,
    /// Sample clock decimation factor.
    pub decimation: u32,
}

/// Narrow interface to a triggered streaming digitizer.
///
/// Buffer memory stays owned by the acquisition stage; the driver is handed
/// the destination slice when a completed buffer is collected, so DMA
/// contents leave the driver only by value-copy.
pub trait DigitizerDriver: Send {
    /// Program clocks, input range, and trigger. Called once per session,
    /// before any buffer is posted.
    fn configure(&mut self, params: &CaptureParams) -> Result<(), DriverError>;

    /// Queue a buffer for capture. [`DriverError::Overrun`] is distinguished
    /// from all other failures: it means the board's posted-buffer capacity
    /// is exhausted, not that the board is broken.
    fn post_buffer(&mut self, handle: BufferHandle) -> Result<(), DriverError>;

    /// Block until the oldest posted buffer (`handle`) completes, copying
    /// its samples into `dest`. Returns [`DriverError::Timeout`] if nothing
    /// completes within `timeout`.
    fn wait_buffer_ready(
        &mut self,
        handle: BufferHandle,
        dest: &mut [u16],
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Begin capturing into the posted buffers.
    fn start_capture(&mut self) -> Result<(), DriverError>;

    /// Stop capturing. Idempotent: aborting an already-stopped board is not
    /// an error.
    fn abort(&mut self) -> Result<(), DriverError>;
}

/// Device register codes for the supported sample rates, keyed by rate in
/// samples per second.
static SAMPLE_RATE_CODES: Lazy<HashMap<u64, u32>> = Lazy::new(|| {
    HashMap::from([
        (1_000, 0x01),
        (2_000, 0x02),
        (5_000, 0x04),
        (10_000, 0x08),
        (20_000, 0x0A),
        (50_000, 0x0C),
        (100_000, 0x0E),
        (200_000, 0x10),
        (500_000, 0x12),
        (1_000_000, 0x14),
        (2_000_000, 0x18),
        (5_000_000, 0x1A),
        (10_000_000, 0x1C),
        (20_000_000, 0x1E),
        (25_000_000, 0x21),
        (50_000_000, 0x22),
        (100_000_000, 0x24),
        (125_000_000, 0x25),
        (160_000_000, 0x26),
        (180_000_000, 0x27),
    ])
});

/// Device register codes for the supported full-scale input ranges, keyed by
/// range in millivolts.
static INPUT_RANGE_CODES: Lazy<HashMap<u64, u32>> = Lazy::new(|| {
    HashMap::from([
        (40, 0x02),
        (50, 0x03),
        (80, 0x04),
        (100, 0x05),
        (200, 0x06),
        (400, 0x07),
        (500, 0x08),
        (800, 0x09),
        (1_000, 0x0A),
        (2_000, 0x0B),
        (4_000, 0x0C),
    ])
});

/// Register code for a sample rate in samples per second, if supported.
pub fn sample_rate_code(samples_per_sec: f64) -> Option<u32> {
    let key = samples_per_sec.round();
    if key < 0.0 || (key - samples_per_sec).abs() > 0.5 {
        return None;
    }
    SAMPLE_RATE_CODES.get(&(key as u64)).copied()
}

/// Register code for a full-scale input range in volts, if supported.
pub fn input_range_code(range_volts: f64) -> Option<u32> {
    let millivolts = (range_volts * 1000.0).round();
    if millivolts < 0.0 {
        return None;
    }
    INPUT_RANGE_CODES.get(&(millivolts as u64)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_rates_have_unique_codes() {
        let mut seen = std::collections::HashSet::new();
        for code in SAMPLE_RATE_CODES.values() {
            assert!(seen.insert(code), "duplicate rate code {code:#x}");
        }
    }

    #[test]
    fn rate_lookup_accepts_supported_and_rejects_unsupported() {
        assert_eq!(sample_rate_code(180_000_000.0), Some(0x27));
        assert_eq!(sample_rate_code(1_000.0), Some(0x01));
        assert_eq!(sample_rate_code(42.0), None);
        assert_eq!(sample_rate_code(-1_000.0), None);
    }

    #[test]
    fn range_lookup_works_in_volts() {
        assert_eq!(input_range_code(0.4), Some(0x07));
        assert_eq!(input_range_code(2.0), Some(0x0B));
        assert_eq!(input_range_code(0.123), None);
    }
}
