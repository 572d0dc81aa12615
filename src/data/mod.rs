//! Sample record containers passed between pipeline stages.

pub mod records;

pub use records::{FrequencyRecord, IqTimeRecord, PowerRecord, RealTimeRecord};
