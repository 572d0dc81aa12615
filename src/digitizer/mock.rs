//! Simulated digitizer for running the pipeline without hardware.
//!
//! The simulator models a triggered streaming board closely enough to
//! exercise every acquisition-stage code path: buffers complete in posted
//! order after a scaled buffer period, samples carry a configurable test
//! tone plus noise, and the failure knobs (`overrun_on_post`,
//! `stall_on_wait`) script the overrun and trigger-loss conditions the
//! stage must handle.

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{
    input_range_code, sample_rate_code, BufferHandle, CaptureParams, DigitizerDriver, DriverError,
};

/// Seed for the deterministic noise generator.
const NOISE_SEED: u64 = 0x0dd5_eed5;

/// Full-scale count of a 16-bit sample.
const FULL_SCALE: f64 = 65535.0;

/// Simulated triggered streaming digitizer.
pub struct SimulatedDigitizer {
    params: Option<CaptureParams>,
    posted: VecDeque<BufferHandle>,
    capturing: bool,
    sample_clock: u64,
    tone_hz: f64,
    tone_amplitude: f64,
    noise_amplitude: f64,
    time_scale: f64,
    overrun_on_post: Option<u64>,
    posts_seen: u64,
    stall_on_wait: Option<u64>,
    waits_seen: u64,
    rng: StdRng,
}

impl SimulatedDigitizer {
    /// Create a simulator producing a quiet midscale baseline.
    pub fn new() -> Self {
        Self {
            params: None,
            posted: VecDeque::new(),
            capturing: false,
            sample_clock: 0,
            tone_hz: 0.0,
            tone_amplitude: 0.0,
            noise_amplitude: 0.0,
            time_scale: 1.0,
            overrun_on_post: None,
            posts_seen: 0,
            stall_on_wait: None,
            waits_seen: 0,
            rng: StdRng::seed_from_u64(NOISE_SEED),
        }
    }

    /// Inject a sinusoidal test tone.
    ///
    /// `amplitude` is a fraction of the configured full-scale range; values
    /// much above 0.5 will clip, as they would on the real board.
    pub fn with_tone(mut self, frequency_hz: f64, amplitude: f64) -> Self {
        self.tone_hz = frequency_hz;
        self.tone_amplitude = amplitude;
        self
    }

    /// Add uniform noise, as a fraction of full scale.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise_amplitude = amplitude;
        self
    }

    /// Speed the simulated clock up by `scale` (buffers complete `scale`
    /// times faster than real time). Tests use large factors.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale;
        self
    }

    /// Script a one-shot overrun on the `nth` `post_buffer` call (1-based,
    /// counting every post since construction).
    pub fn overrun_on_post(mut self, nth: u64) -> Self {
        self.overrun_on_post = Some(nth);
        self
    }

    /// Script a permanent trigger loss: every `wait_buffer_ready` call from
    /// the `nth` onward (1-based) times out.
    pub fn stall_on_wait(mut self, nth: u64) -> Self {
        self.stall_on_wait = Some(nth);
        self
    }

    /// Number of buffers currently posted to the simulated board.
    pub fn posted_count(&self) -> usize {
        self.posted.len()
    }

    /// Total `post_buffer` calls seen, including failed ones.
    pub fn posts_seen(&self) -> u64 {
        self.posts_seen
    }

    /// Total `wait_buffer_ready` calls seen, including failed ones.
    pub fn waits_seen(&self) -> u64 {
        self.waits_seen
    }

    fn effective_rate(&self) -> f64 {
        match &self.params {
            Some(params) => params.sample_rate / f64::from(params.decimation.max(1)),
            None => 0.0,
        }
    }

    fn synthesize(&mut self, dest: &mut [u16]) {
        let rate = self.effective_rate();
        let range = self
            .params
            .as_ref()
            .map(|p| p.input_range_volts)
            .unwrap_or(1.0);
        for (offset, sample) in dest.iter_mut().enumerate() {
            let t = (self.sample_clock + offset as u64) as f64 / rate;
            let mut volts = self.tone_amplitude * range * (TAU * self.tone_hz * t).sin();
            if self.noise_amplitude > 0.0 {
                volts += self.noise_amplitude * range * self.rng.gen_range(-0.5..0.5);
            }
            let fraction = (volts / range + 0.5).clamp(0.0, 1.0);
            *sample = (fraction * FULL_SCALE) as u16;
        }
        self.sample_clock += dest.len() as u64;
    }
}

impl Default for SimulatedDigitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitizerDriver for SimulatedDigitizer {
    fn configure(&mut self, params: &CaptureParams) -> Result<(), DriverError> {
        sample_rate_code(params.sample_rate).ok_or_else(|| {
            DriverError::Fault(format!(
                "unsupported sample rate {} S/s",
                params.sample_rate
            ))
        })?;
        input_range_code(params.input_range_volts).ok_or_else(|| {
            DriverError::Fault(format!(
                "unsupported input range {} V",
                params.input_range_volts
            ))
        })?;
        debug!(
            rate = params.sample_rate,
            range_volts = params.input_range_volts,
            decimation = params.decimation,
            "simulated board configured"
        );
        self.params = Some(params.clone());
        Ok(())
    }

    fn post_buffer(&mut self, handle: BufferHandle) -> Result<(), DriverError> {
        if self.params.is_none() {
            return Err(DriverError::Fault("board not configured".to_string()));
        }
        self.posts_seen += 1;
        if self.overrun_on_post == Some(self.posts_seen) {
            // One-shot: the board recovers once the stage restarts capture.
            self.overrun_on_post = None;
            return Err(DriverError::Overrun);
        }
        if self.posted.contains(&handle) {
            return Err(DriverError::Fault(format!(
                "buffer {} posted twice",
                handle.index()
            )));
        }
        self.posted.push_back(handle);
        Ok(())
    }

    fn wait_buffer_ready(
        &mut self,
        handle: BufferHandle,
        dest: &mut [u16],
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.waits_seen += 1;
        if let Some(nth) = self.stall_on_wait {
            if self.waits_seen >= nth {
                thread::sleep(timeout.min(Duration::from_millis(5)));
                return Err(DriverError::Timeout);
            }
        }
        if !self.capturing {
            return Err(DriverError::Fault("capture not started".to_string()));
        }
        match self.posted.front() {
            Some(oldest) if *oldest == handle => {}
            Some(oldest) => {
                return Err(DriverError::Fault(format!(
                    "waited on buffer {} but buffer {} is oldest",
                    handle.index(),
                    oldest.index()
                )));
            }
            None => return Err(DriverError::Fault("no buffers posted".to_string())),
        }

        let rate = self.effective_rate();
        let period = Duration::from_secs_f64(dest.len() as f64 / rate / self.time_scale);
        if period > timeout {
            thread::sleep(timeout.min(Duration::from_millis(5)));
            return Err(DriverError::Timeout);
        }
        thread::sleep(period);

        self.posted.pop_front();
        self.synthesize(dest);
        Ok(())
    }

    fn start_capture(&mut self) -> Result<(), DriverError> {
        if self.params.is_none() {
            return Err(DriverError::Fault("board not configured".to_string()));
        }
        self.capturing = true;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), DriverError> {
        // Idempotent: aborting a stopped board clears any stale postings.
        self.capturing = false;
        self.posted.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digitizer::TriggerParams;

    fn params() -> CaptureParams {
        CaptureParams {
            sample_rate: 1_000_000.0,
            input_range_volts: 0.4,
            trigger: TriggerParams::default(),
            decimation: 1,
        }
    }

    fn configured() -> SimulatedDigitizer {
        let mut sim = SimulatedDigitizer::new().with_time_scale(1.0e6);
        sim.configure(&params()).unwrap();
        sim
    }

    #[test]
    fn buffers_complete_in_posted_order() {
        let mut sim = configured();
        sim.post_buffer(BufferHandle::new(0)).unwrap();
        sim.post_buffer(BufferHandle::new(1)).unwrap();
        sim.start_capture().unwrap();

        let mut data = vec![0u16; 64];
        // Waiting on the newest buffer first is a driver fault.
        assert!(matches!(
            sim.wait_buffer_ready(BufferHandle::new(1), &mut data, Duration::from_secs(1)),
            Err(DriverError::Fault(_))
        ));
        sim.wait_buffer_ready(BufferHandle::new(0), &mut data, Duration::from_secs(1))
            .unwrap();
        sim.wait_buffer_ready(BufferHandle::new(1), &mut data, Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn scripted_overrun_fires_once() {
        let mut sim = SimulatedDigitizer::new()
            .with_time_scale(1.0e6)
            .overrun_on_post(2);
        sim.configure(&params()).unwrap();

        sim.post_buffer(BufferHandle::new(0)).unwrap();
        assert_eq!(
            sim.post_buffer(BufferHandle::new(1)),
            Err(DriverError::Overrun)
        );
        // The condition clears; the same buffer posts cleanly afterwards.
        sim.post_buffer(BufferHandle::new(1)).unwrap();
    }

    #[test]
    fn abort_is_idempotent() {
        let mut sim = configured();
        sim.start_capture().unwrap();
        sim.abort().unwrap();
        sim.abort().unwrap();
        assert_eq!(sim.posted_count(), 0);
    }

    #[test]
    fn tone_fills_buffers_with_a_sinusoid() {
        let mut sim = SimulatedDigitizer::new()
            .with_time_scale(1.0e6)
            .with_tone(250_000.0, 0.25);
        sim.configure(&params()).unwrap();
        sim.post_buffer(BufferHandle::new(0)).unwrap();
        sim.start_capture().unwrap();

        let mut data = vec![0u16; 16];
        sim.wait_buffer_ready(BufferHandle::new(0), &mut data, Duration::from_secs(1))
            .unwrap();

        // 250 kHz at 1 MS/s is a quarter of the sample rate: the tone
        // repeats every 4 samples around midscale.
        let midscale = 32767u16;
        assert!(data[0].abs_diff(midscale) < 200);
        assert!(data[1] > midscale);
        assert!(data[3] < midscale);
    }

    #[test]
    fn unsupported_rate_is_rejected_at_configure() {
        let mut sim = SimulatedDigitizer::new();
        let mut bad = params();
        bad.sample_rate = 123_456.0;
        assert!(matches!(
            sim.configure(&bad),
            Err(DriverError::Fault(_))
        ));
    }
}
