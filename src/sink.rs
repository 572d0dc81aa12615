//! Dead-end sink stage.
//!
//! Terminates a stream channel, counting records and session transitions.
//! The standard downstream consumer for tests and demos; real deployments
//! hang a file writer or relay on the same consumer interface instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::pipeline::{PipelineStage, StageContext};
use crate::stream::{Polled, StreamConsumer, StreamSignal};

const POLL: Duration = Duration::from_millis(20);

/// Shared counters published by a [`DeadEnd`] stage.
#[derive(Clone, Debug, Default)]
pub struct SinkCounters {
    records: Arc<AtomicU64>,
    sessions: Arc<AtomicU64>,
    protocol_violations: Arc<AtomicU64>,
}

impl SinkCounters {
    /// Records consumed across all sessions.
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Acquire)
    }

    /// Sessions observed (one per `start`).
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Acquire)
    }

    /// Records that arrived outside a `start`..`stop` session.
    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations.load(Ordering::Acquire)
    }
}

/// Pipeline stage that consumes and discards records.
pub struct DeadEnd<T> {
    input: StreamConsumer<T>,
    counters: SinkCounters,
    in_session: bool,
}

impl<T: Send> DeadEnd<T> {
    /// Create the stage plus the counter handle to observe it with.
    pub fn new(input: StreamConsumer<T>) -> (Self, SinkCounters) {
        let counters = SinkCounters::default();
        (
            Self {
                input,
                counters: counters.clone(),
                in_session: false,
            },
            counters,
        )
    }
}

impl<T: Send> PipelineStage for DeadEnd<T> {
    fn name(&self) -> &'static str {
        "dead-end"
    }

    fn execute(&mut self, ctx: &mut StageContext) -> AppResult<()> {
        while !ctx.is_canceled() {
            if let Some(instruction) = ctx.latest_instruction() {
                debug!(?instruction, "no instructions supported; ignored");
            }

            match self.input.poll(POLL) {
                Polled::Pending => {}
                Polled::Record(_record) => {
                    if !self.in_session {
                        warn!("record arrived outside a session");
                        self.counters
                            .protocol_violations
                            .fetch_add(1, Ordering::AcqRel);
                    }
                    self.counters.records.fetch_add(1, Ordering::AcqRel);
                }
                Polled::Signal(StreamSignal::Start) => {
                    debug!("session start");
                    self.counters.sessions.fetch_add(1, Ordering::AcqRel);
                    self.in_session = true;
                }
                Polled::Signal(StreamSignal::Stop) => {
                    debug!("session stop");
                    self.in_session = false;
                }
                Polled::Signal(StreamSignal::Error) => {
                    warn!("upstream error reached the sink");
                    self.in_session = false;
                }
                Polled::Signal(StreamSignal::Exit) | Polled::Disconnected => break,
                Polled::Signal(StreamSignal::Run) => {
                    warn!("bare run signal without a record; dropped");
                }
            }
        }
        info!(
            records = self.counters.records(),
            sessions = self.counters.sessions(),
            "dead end exiting"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_context;
    use crate::stream::stream_channel;

    #[test]
    fn counts_records_and_sessions() {
        let (mut tx, rx) = stream_channel(8, || 0u32);
        let (mut sink, counters) = DeadEnd::new(rx);
        let (mut ctx, _ix) = test_context();
        let cancel = ctx.cancel_token().clone();

        tx.send_signal(StreamSignal::Start, &cancel).unwrap();
        for i in 0..5 {
            tx.send_record(&cancel, |r| *r = i).unwrap();
        }
        tx.send_signal(StreamSignal::Stop, &cancel).unwrap();
        tx.send_signal(StreamSignal::Exit, &cancel).unwrap();

        sink.execute(&mut ctx).unwrap();

        assert_eq!(counters.records(), 5);
        assert_eq!(counters.sessions(), 1);
        assert_eq!(counters.protocol_violations(), 0);
    }

    #[test]
    fn record_outside_a_session_is_flagged() {
        let (mut tx, rx) = stream_channel(4, || 0u32);
        let (mut sink, counters) = DeadEnd::new(rx);
        let (mut ctx, _ix) = test_context();
        let cancel = ctx.cancel_token().clone();

        tx.send_record(&cancel, |r| *r = 1).unwrap();
        tx.send_signal(StreamSignal::Exit, &cancel).unwrap();

        sink.execute(&mut ctx).unwrap();

        assert_eq!(counters.records(), 1);
        assert_eq!(counters.protocol_violations(), 1);
    }
}
