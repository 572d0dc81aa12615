//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes that show up in a
//! streaming acquisition system:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or
//!   format issues in the configuration files.
//! - **`Configuration`**: Semantic errors in the configuration: values that
//!   parse but are logically invalid (an unknown transform flag, an internal
//!   reference clock combined with decimation). These are caught during the
//!   validation step, before any hardware I/O.
//! - **`Driver`**: Digitizer driver failures other than the locally-handled
//!   overrun condition. These are fatal to the acquisition stage.
//! - **`Stream`**: Inter-stage channel failures (cancellation, a disconnected
//!   peer).
//! - **`Processing`**: Errors in the transform/averaging stages, such as a
//!   record whose length no longer matches its stage's plan.
//! - **`Stage`**: Wraps any of the above with the name of the pipeline stage
//!   it originated in, so a fatal error is reported against the stage that
//!   raised it.
//!
//! By using `#[from]`, `DaqError` can be created seamlessly from underlying
//! error types with the `?` operator.

use thiserror::Error;

use crate::digitizer::DriverError;
use crate::stream::StreamError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Top-level error type for the acquisition pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or terminal I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Digitizer driver failure that the acquisition stage cannot recover from.
    #[error("Digitizer driver error: {0}")]
    Driver(#[from] DriverError),

    /// Inter-stage stream channel failure.
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Record allocation or transform failure in a processing stage.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// A fatal error attributed to a named pipeline stage.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        /// Name of the stage the error originated in.
        stage: String,
        /// The underlying failure.
        #[source]
        source: Box<DaqError>,
    },
}

impl DaqError {
    /// Attach a stage name to an error for top-level reporting.
    pub fn in_stage(self, stage: &str) -> Self {
        match self {
            already @ DaqError::Stage { .. } => already,
            other => DaqError::Stage {
                stage: stage.to_string(),
                source: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_preserves_underlying_message() {
        let err = DaqError::Processing("fft size mismatch".to_string()).in_stage("fft");
        let text = err.to_string();
        assert!(text.contains("fft"));
        assert!(text.contains("fft size mismatch"));
    }

    #[test]
    fn stage_wrapping_is_not_applied_twice() {
        let err = DaqError::Processing("boom".to_string())
            .in_stage("averager")
            .in_stage("runner");
        match err {
            DaqError::Stage { stage, .. } => assert_eq!(stage, "averager"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn driver_error_converts_with_question_mark() {
        fn fails() -> AppResult<()> {
            Err(DriverError::Fault("board went away".to_string()))?;
            Ok(())
        }
        match fails() {
            Err(DaqError::Driver(DriverError::Fault(msg))) => {
                assert_eq!(msg, "board went away");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
