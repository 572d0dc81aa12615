//! Configuration loading and validation.
//!
//! Configuration is strongly typed and loaded with `figment` from:
//! 1. a TOML file (`spectral-daq.toml` by default), then
//! 2. environment variables prefixed with `SPECTRAL_DAQ_`.
//!
//! Keys are kebab-case. Parsing catches malformed values; the [`Config::validate`]
//! pass catches semantic errors (an unknown transform flag, an internal
//! reference clock combined with decimation, a sample rate the digitizer has
//! no register code for) before any hardware I/O is attempted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::digitizer::{input_range_code, sample_rate_code, TriggerParams};
use crate::error::{AppResult, DaqError};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "spectral-daq.toml";

/// Plan build effort hints accepted for `transform-flag`.
pub const TRANSFORM_FLAGS: [&str; 4] = ["ESTIMATE", "MEASURE", "PATIENT", "EXHAUSTIVE"];

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Application-wide settings (logging).
    pub application: ApplicationConfig,
    /// Acquisition stage settings.
    pub digitizer: DigitizerConfig,
    /// Forward transform stage settings.
    pub transform: TransformConfig,
    /// Power averager stage settings.
    pub averager: AveragerConfig,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApplicationConfig {
    /// Logging level: trace, debug, info, warn, or error.
    pub log_level: String,
    /// Log output format: pretty, compact, or json.
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Reference clock selection for the digitizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReferenceSource {
    /// The board's internal oscillator. Does not support decimation.
    #[default]
    #[serde(rename = "internal")]
    Internal,
    /// External 10 MHz laboratory reference; the sample clock may be
    /// decimated from it.
    #[serde(rename = "external-10mhz")]
    External10MHz,
}

/// Acquisition Buffer Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DigitizerConfig {
    /// Samples captured into each DMA buffer.
    pub samples_per_buffer: usize,
    /// Number of DMA buffers in the pool.
    pub dma_buffer_count: usize,
    /// Sample clock in samples per second.
    pub samples_per_sec: f64,
    /// Sample clock decimation factor (requires the external reference).
    pub decimation_factor: u32,
    /// Length of one acquisition run in seconds.
    pub acquisition_length_sec: f64,
    /// Reference clock selection.
    pub reference_source: ReferenceSource,
    /// Full-scale input range in volts.
    pub input_range_volts: f64,
    /// Trigger settings.
    pub trigger: TriggerParams,
    /// Buffer-wait timeout, in units of one buffer period. A wait longer
    /// than a few buffer periods means the hardware stopped triggering.
    pub wait_timeout_buffer_periods: u32,
    /// ADC resolution in bits.
    pub bits_per_sample: u32,
    /// Number of enabled input channels.
    pub channel_count: u32,
    /// Output ring length, in records.
    pub stream_slots: usize,
}

impl Default for DigitizerConfig {
    fn default() -> Self {
        Self {
            samples_per_buffer: 4096,
            dma_buffer_count: 64,
            samples_per_sec: 100_000_000.0,
            decimation_factor: 1,
            acquisition_length_sec: 0.1,
            reference_source: ReferenceSource::Internal,
            input_range_volts: 0.4,
            trigger: TriggerParams::default(),
            wait_timeout_buffer_periods: 5,
            bits_per_sample: 16,
            channel_count: 1,
            stream_slots: 10,
        }
    }
}

impl DigitizerConfig {
    /// Bytes occupied by one sample.
    pub fn bytes_per_sample(&self) -> u32 {
        (self.bits_per_sample + 7) / 8
    }

    /// Bytes occupied by one DMA buffer across all channels.
    pub fn bytes_per_buffer(&self) -> u64 {
        u64::from(self.bytes_per_sample())
            * self.samples_per_buffer as u64
            * u64::from(self.channel_count)
    }

    /// Sample clock after decimation, in samples per second.
    pub fn effective_sample_rate(&self) -> f64 {
        self.samples_per_sec / f64::from(self.decimation_factor.max(1))
    }

    /// Total samples in one acquisition run, rounded to the nearest sample.
    pub fn samples_per_acquisition(&self) -> u64 {
        (self.effective_sample_rate() * self.acquisition_length_sec + 0.5) as u64
    }

    /// Buffers needed to cover one acquisition run, rounded up.
    pub fn buffers_per_acquisition(&self) -> u64 {
        self.samples_per_acquisition()
            .div_ceil(self.samples_per_buffer as u64)
    }

    /// Wall-clock duration of one buffer at the effective sample rate.
    pub fn buffer_period(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_buffer as f64 / self.effective_sample_rate())
    }

    /// Deadline for one hardware buffer wait.
    pub fn wait_timeout(&self) -> Duration {
        self.buffer_period() * self.wait_timeout_buffer_periods
    }
}

/// Input record kind consumed by the forward transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransformInput {
    /// Raw ADC samples from the digitizer (converted to volts per record).
    #[default]
    Real,
    /// IQ time-domain samples, already in volts.
    Complex,
}

/// Forward transform stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransformConfig {
    /// Transform length in samples.
    pub fft_size: usize,
    /// Kind of time-domain record consumed.
    pub input_type: TransformInput,
    /// Plan build effort hint.
    pub transform_flag: String,
    /// Reuse plans from a cache file when the FFT backend supports it.
    pub use_wisdom: bool,
    /// Plan cache file location.
    pub plan_cache_path: Option<PathBuf>,
    /// Target frequency (Hz) the output sub-band is centered on; 0 disables
    /// sub-band selection.
    pub freq_in_center_bin: f64,
    /// Minimum output bandwidth (Hz) of the sub-band; 0 disables sub-band
    /// selection.
    pub min_output_bandwidth: f64,
    /// Output ring length, in records.
    pub stream_slots: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            fft_size: 4096,
            input_type: TransformInput::Real,
            transform_flag: "ESTIMATE".to_string(),
            use_wisdom: false,
            plan_cache_path: None,
            freq_in_center_bin: 0.0,
            min_output_bandwidth: 0.0,
            stream_slots: 10,
        }
    }
}

/// Power averager stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AveragerConfig {
    /// Number of spectra accumulated into each emitted power record.
    pub num_to_average: usize,
    /// Number of frequency bins per spectrum.
    pub spectrum_size: usize,
    /// Output ring length, in records.
    pub stream_slots: usize,
}

impl Default for AveragerConfig {
    fn default() -> Self {
        Self {
            num_to_average: 16,
            spectrum_size: 4096,
            stream_slots: 2,
        }
    }
}

impl Config {
    /// Load configuration from the default file plus environment overrides.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file plus environment overrides.
    ///
    /// A missing file is not an error; every section has defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(
                // SPECTRAL_DAQ_DIGITIZER__SAMPLES_PER_BUFFER maps onto
                // digitizer.samples-per-buffer.
                Env::prefixed("SPECTRAL_DAQ_")
                    .map(|key| {
                        key.as_str()
                            .to_lowercase()
                            .replace("__", ".")
                            .replace('_', "-")
                            .into()
                    })
                    .split("."),
            )
            .extract()?;
        Ok(config)
    }

    /// Semantic validation, run before any hardware I/O.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "invalid log-level '{}'; must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "invalid log-format '{}'; must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let digitizer = &self.digitizer;
        if digitizer.samples_per_buffer == 0 {
            return Err(DaqError::Configuration(
                "samples-per-buffer must be positive".to_string(),
            ));
        }
        if digitizer.dma_buffer_count == 0 {
            return Err(DaqError::Configuration(
                "dma-buffer-count must be positive".to_string(),
            ));
        }
        if digitizer.decimation_factor == 0 {
            return Err(DaqError::Configuration(
                "decimation-factor must be at least 1".to_string(),
            ));
        }
        if digitizer.reference_source == ReferenceSource::Internal
            && digitizer.decimation_factor != 1
        {
            return Err(DaqError::Configuration(
                "the internal reference clock does not support decimation; \
                 use reference-source = \"external-10mhz\" or decimation-factor = 1"
                    .to_string(),
            ));
        }
        if digitizer.acquisition_length_sec <= 0.0 {
            return Err(DaqError::Configuration(
                "acquisition-length-sec must be positive".to_string(),
            ));
        }
        if sample_rate_code(digitizer.samples_per_sec).is_none() {
            return Err(DaqError::Configuration(format!(
                "samples-per-sec {} has no digitizer clock code",
                digitizer.samples_per_sec
            )));
        }
        if input_range_code(digitizer.input_range_volts).is_none() {
            return Err(DaqError::Configuration(format!(
                "input-range-volts {} has no digitizer range code",
                digitizer.input_range_volts
            )));
        }

        let transform = &self.transform;
        if transform.fft_size == 0 {
            return Err(DaqError::Configuration(
                "fft-size must be positive".to_string(),
            ));
        }
        if !TRANSFORM_FLAGS.contains(&transform.transform_flag.to_uppercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "invalid transform-flag '{}'; must be one of: {}",
                transform.transform_flag,
                TRANSFORM_FLAGS.join(", ")
            )));
        }
        if transform.min_output_bandwidth < 0.0 || transform.freq_in_center_bin < 0.0 {
            return Err(DaqError::Configuration(
                "freq-in-center-bin and min-output-bandwidth must be non-negative".to_string(),
            ));
        }

        let averager = &self.averager;
        if averager.num_to_average == 0 {
            return Err(DaqError::Configuration(
                "num-to-average must be positive".to_string(),
            ));
        }
        if averager.spectrum_size == 0 {
            return Err(DaqError::Configuration(
                "spectrum-size must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
