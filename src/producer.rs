//! Synthetic data producer stage.
//!
//! A debugging source that continuously emits identical, pre-filled
//! real-time records at a fixed interval. Useful for exercising the
//! transform chain without a digitizer (simulated or otherwise) in the loop.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::RealTimeRecord;
use crate::error::AppResult;
use crate::pipeline::{PipelineStage, StageContext};
use crate::stream::{StreamProducer, StreamSignal};

/// Synthetic producer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProducerConfig {
    /// Samples per emitted record.
    pub data_size: usize,
    /// Constant raw value every sample is set to.
    pub data_value: u16,
    /// Dynamic-range metadata stamped on each record, in volts.
    pub dynamic_range: f64,
    /// Delay between records in milliseconds.
    pub delay_time_ms: u64,
    /// Output ring length, in records.
    pub stream_slots: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            data_size: 16384,
            data_value: 5,
            dynamic_range: 1.0,
            delay_time_ms: 500,
            stream_slots: 10,
        }
    }
}

/// Pipeline stage emitting blank records on a timer.
pub struct DataProducer {
    config: ProducerConfig,
    output: StreamProducer<RealTimeRecord>,
    template: RealTimeRecord,
    chunk_counter: u64,
}

impl DataProducer {
    /// Create the stage.
    pub fn new(config: ProducerConfig, output: StreamProducer<RealTimeRecord>) -> Self {
        Self {
            config,
            output,
            template: RealTimeRecord::default(),
            chunk_counter: 0,
        }
    }
}

impl PipelineStage for DataProducer {
    fn name(&self) -> &'static str {
        "data-producer"
    }

    fn initialize(&mut self) -> AppResult<()> {
        self.template.allocate(self.config.data_size)?;
        self.template.set_dynamic_range(self.config.dynamic_range);
        let value = self.config.data_value;
        for sample in self.template.samples_mut() {
            *sample = value;
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &mut StageContext) -> AppResult<()> {
        self.output
            .send_signal(StreamSignal::Start, ctx.cancel_token())?;
        info!("starting main loop; sending packets");

        while !ctx.is_canceled() {
            if let Some(instruction) = ctx.latest_instruction() {
                debug!(?instruction, "no instructions supported; ignored");
            }

            let template = &self.template;
            let chunk = self.chunk_counter;
            match self.output.send_record(ctx.cancel_token(), |record| {
                if record.is_empty() {
                    let _ = record.allocate(template.len());
                }
                record.samples_mut().copy_from_slice(template.samples());
                record.set_dynamic_range(template.dynamic_range());
                record.set_chunk_counter(chunk);
            }) {
                Ok(()) => self.chunk_counter += 1,
                Err(err) if err.is_cancellation() => break,
                Err(err) => return Err(err.into()),
            }

            thread::sleep(Duration::from_millis(self.config.delay_time_ms));
        }

        info!("data producer exiting");
        let _ = self
            .output
            .send_signal(StreamSignal::Stop, ctx.cancel_token());
        let _ = self
            .output
            .send_signal(StreamSignal::Exit, ctx.cancel_token());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_context;
    use crate::stream::{stream_channel, Polled};

    #[test]
    fn emits_constant_records_with_increasing_chunks() {
        let config = ProducerConfig {
            data_size: 64,
            data_value: 5,
            dynamic_range: 0.5,
            delay_time_ms: 1,
            stream_slots: 8,
        };
        let (tx, mut rx) = stream_channel(8, RealTimeRecord::default);
        let mut producer = DataProducer::new(config, tx);
        let (mut ctx, _ix) = test_context();
        let cancel = ctx.cancel_token().clone();

        let thread = std::thread::spawn(move || {
            producer.initialize().unwrap();
            producer.execute(&mut ctx).unwrap();
        });

        match rx.poll(Duration::from_millis(500)) {
            Polled::Signal(StreamSignal::Start) => {}
            _ => panic!("expected start before any data"),
        }
        for expected_chunk in 0..3u64 {
            match rx.poll(Duration::from_millis(500)) {
                Polled::Record(record) => {
                    assert_eq!(record.len(), 64);
                    assert_eq!(record.chunk_counter(), expected_chunk);
                    assert_eq!(record.dynamic_range(), 0.5);
                    assert!(record.samples().iter().all(|&s| s == 5));
                }
                _ => panic!("expected record {expected_chunk}"),
            }
        }

        cancel.cancel();
        thread.join().unwrap();

        // The producer closes its session on the way out.
        let mut tail = Vec::new();
        loop {
            match rx.poll(Duration::from_millis(5)) {
                Polled::Signal(signal) => tail.push(signal),
                Polled::Record(_) => {}
                Polled::Pending | Polled::Disconnected => break,
            }
        }
        assert!(tail.ends_with(&[StreamSignal::Stop, StreamSignal::Exit]));
    }
}
