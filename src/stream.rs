//! Inter-stage stream channels.
//!
//! A stream channel is the only communication path between two adjacent
//! pipeline stages. It is a pair of single-producer single-consumer rings:
//! a *data* ring carrying slot envelopes (a signal plus, for `run`, a sample
//! record) and a *free* ring returning consumed records to the producer for
//! reuse. Records are allocated once when the channel is built; the steady
//! state recycles them, so a slow consumer exerts backpressure by starving
//! the producer of free records rather than by dropping data.
//!
//! # Signals
//!
//! Every slot carries a signal value:
//!
//! - `start`: a session begins; the consumer resets any accumulation state
//! - `run`: the slot holds a valid record to process
//! - `stop`: the session ends; the consumer flushes pending partial state
//!   and propagates `stop` downstream
//! - `error`: upstream failure; slot data must not be trusted
//! - `exit`: the channel is closing permanently
//!
//! The absence of a slot within a poll timeout plays the role of a `none`
//! signal: the consumer must return to its loop, re-check instructions and
//! cancellation, and poll again rather than block indefinitely.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use thiserror::Error;

use crate::pipeline::CancelToken;

/// Interval between ring re-checks while waiting for a slot or a free record.
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Extra data-ring capacity so control signals can be queued even when every
/// record slot is in flight.
const CONTROL_HEADROOM: usize = 4;

/// Control transitions multiplexed onto the record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    /// Session begins; downstream accumulation state resets.
    Start,
    /// Slot holds a valid record.
    Run,
    /// Session ends; downstream flushes partial state.
    Stop,
    /// Upstream failure; slot data is not trustworthy.
    Error,
    /// Channel is closing permanently.
    Exit,
}

impl std::fmt::Display for StreamSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamSignal::Start => "start",
            StreamSignal::Run => "run",
            StreamSignal::Stop => "stop",
            StreamSignal::Error => "error",
            StreamSignal::Exit => "exit",
        };
        write!(f, "{name}")
    }
}

/// Failure modes of a channel endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The pipeline was canceled while waiting on the channel.
    #[error("stream operation canceled")]
    Canceled,
    /// The peer endpoint was dropped.
    #[error("peer stream endpoint disconnected")]
    Disconnected,
}

impl StreamError {
    /// True when the failure is pipeline cancellation rather than a broken
    /// channel; processing loops treat it as a prompt-exit request, not a
    /// stage failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

struct Links {
    producer_alive: AtomicBool,
    consumer_alive: AtomicBool,
}

struct Envelope<T> {
    signal: StreamSignal,
    record: Option<T>,
}

/// Build a stream channel with `slots` records created by `init`.
///
/// The returned producer and consumer halves are independently `Send`, one
/// per stage thread.
pub fn stream_channel<T>(
    slots: usize,
    mut init: impl FnMut() -> T,
) -> (StreamProducer<T>, StreamConsumer<T>) {
    let (data_tx, data_rx) = HeapRb::<Envelope<T>>::new(slots + CONTROL_HEADROOM).split();
    let (mut free_tx, free_rx) = HeapRb::<T>::new(slots).split();
    for _ in 0..slots {
        // Capacity equals the record count; this cannot fail.
        let _ = free_tx.push(init());
    }
    let links = Arc::new(Links {
        producer_alive: AtomicBool::new(true),
        consumer_alive: AtomicBool::new(true),
    });
    (
        StreamProducer {
            data: data_tx,
            free: free_rx,
            links: Arc::clone(&links),
        },
        StreamConsumer {
            data: data_rx,
            free: free_tx,
            links,
        },
    )
}

/// Writing half of a stream channel, owned by the upstream stage.
pub struct StreamProducer<T> {
    data: HeapProducer<Envelope<T>>,
    free: HeapConsumer<T>,
    links: Arc<Links>,
}

impl<T> StreamProducer<T> {
    /// Emit a control signal. Does not consume a record slot.
    pub fn send_signal(
        &mut self,
        signal: StreamSignal,
        cancel: &CancelToken,
    ) -> Result<(), StreamError> {
        self.push_envelope(
            Envelope {
                signal,
                record: None,
            },
            cancel,
        )
    }

    /// Acquire a free record, let `fill` populate it, and emit it as `run`.
    ///
    /// Blocks (with cancellation checks) while the downstream stage holds
    /// every record; this is the backpressure point of the pipeline.
    pub fn send_record(
        &mut self,
        cancel: &CancelToken,
        fill: impl FnOnce(&mut T),
    ) -> Result<(), StreamError> {
        let mut record = self.acquire_free(cancel)?;
        fill(&mut record);
        self.push_envelope(
            Envelope {
                signal: StreamSignal::Run,
                record: Some(record),
            },
            cancel,
        )
    }

    /// Number of records currently waiting in the free ring.
    pub fn free_records(&self) -> usize {
        self.free.len()
    }

    fn acquire_free(&mut self, cancel: &CancelToken) -> Result<T, StreamError> {
        loop {
            if let Some(record) = self.free.pop() {
                return Ok(record);
            }
            if !self.links.consumer_alive.load(Ordering::Acquire) {
                return Err(StreamError::Disconnected);
            }
            if cancel.is_canceled() {
                return Err(StreamError::Canceled);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn push_envelope(
        &mut self,
        mut envelope: Envelope<T>,
        cancel: &CancelToken,
    ) -> Result<(), StreamError> {
        loop {
            match self.data.push(envelope) {
                Ok(()) => return Ok(()),
                Err(rejected) => envelope = rejected,
            }
            if !self.links.consumer_alive.load(Ordering::Acquire) {
                return Err(StreamError::Disconnected);
            }
            if cancel.is_canceled() {
                return Err(StreamError::Canceled);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl<T> Drop for StreamProducer<T> {
    fn drop(&mut self) {
        self.links.producer_alive.store(false, Ordering::Release);
    }
}

/// Outcome of one consumer poll.
pub enum Polled<'a, T> {
    /// No slot arrived within the timeout; re-check instructions and
    /// cancellation, then poll again.
    Pending,
    /// A control transition (`start`, `stop`, `error`, or `exit`).
    Signal(StreamSignal),
    /// A `run` slot holding a record. Dropping the guard releases the record
    /// back to the producer.
    Record(RecordGuard<'a, T>),
    /// The producer endpoint is gone and the channel is drained.
    Disconnected,
}

/// Reading half of a stream channel, owned by the downstream stage.
pub struct StreamConsumer<T> {
    data: HeapConsumer<Envelope<T>>,
    free: HeapProducer<T>,
    links: Arc<Links>,
}

impl<T> StreamConsumer<T> {
    /// Wait up to `timeout` for the next slot.
    pub fn poll(&mut self, timeout: Duration) -> Polled<'_, T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.data.pop() {
                return match envelope.record {
                    Some(record) => Polled::Record(RecordGuard {
                        record: Some(record),
                        free: &mut self.free,
                    }),
                    None => Polled::Signal(envelope.signal),
                };
            }
            if !self.links.producer_alive.load(Ordering::Acquire) {
                return Polled::Disconnected;
            }
            let now = Instant::now();
            if now >= deadline {
                return Polled::Pending;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl<T> Drop for StreamConsumer<T> {
    fn drop(&mut self) {
        self.links.consumer_alive.store(false, Ordering::Release);
    }
}

/// Exclusive access to one in-flight record. The record returns to the free
/// ring when the guard drops, releasing the slot to the producer.
pub struct RecordGuard<'a, T> {
    record: Option<T>,
    free: &'a mut HeapProducer<T>,
}

impl<T> Deref for RecordGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Invariant: `record` is Some until drop.
        match &self.record {
            Some(record) => record,
            None => unreachable!(),
        }
    }
}

impl<T> DerefMut for RecordGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.record {
            Some(record) => record,
            None => unreachable!(),
        }
    }
}

impl<T> Drop for RecordGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            // The free ring is sized for every record in the channel.
            let _ = self.free.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(5);
    const LONG: Duration = Duration::from_millis(500);

    #[test]
    fn signals_and_records_arrive_in_order() {
        let cancel = CancelToken::new();
        let (mut tx, mut rx) = stream_channel(4, || 0u32);

        tx.send_signal(StreamSignal::Start, &cancel).unwrap();
        tx.send_record(&cancel, |r| *r = 7).unwrap();
        tx.send_record(&cancel, |r| *r = 8).unwrap();
        tx.send_signal(StreamSignal::Stop, &cancel).unwrap();

        assert!(matches!(
            rx.poll(SHORT),
            Polled::Signal(StreamSignal::Start)
        ));
        match rx.poll(SHORT) {
            Polled::Record(guard) => assert_eq!(*guard, 7),
            _ => panic!("expected a record"),
        }
        match rx.poll(SHORT) {
            Polled::Record(guard) => assert_eq!(*guard, 8),
            _ => panic!("expected a record"),
        }
        assert!(matches!(rx.poll(SHORT), Polled::Signal(StreamSignal::Stop)));
        assert!(matches!(rx.poll(SHORT), Polled::Pending));
    }

    #[test]
    fn empty_channel_polls_pending_within_timeout() {
        let (_tx, mut rx) = stream_channel(2, || 0u8);
        let before = Instant::now();
        assert!(matches!(rx.poll(SHORT), Polled::Pending));
        assert!(before.elapsed() >= SHORT);
    }

    #[test]
    fn records_recycle_through_the_free_ring() {
        let cancel = CancelToken::new();
        let (mut tx, mut rx) = stream_channel(2, || 0u64);

        // Many more sends than slots; each consume frees a record.
        for i in 0..20u64 {
            tx.send_record(&cancel, |r| *r = i).unwrap();
            match rx.poll(LONG) {
                Polled::Record(guard) => assert_eq!(*guard, i),
                _ => panic!("expected record {i}"),
            }
        }
        assert_eq!(tx.free_records(), 2);
    }

    #[test]
    fn full_channel_blocks_producer_until_consumer_releases() {
        let cancel = CancelToken::new();
        let (mut tx, mut rx) = stream_channel(2, || 0u32);
        tx.send_record(&cancel, |r| *r = 1).unwrap();
        tx.send_record(&cancel, |r| *r = 2).unwrap();

        let producer = thread::spawn(move || {
            let cancel = CancelToken::new();
            // Blocks until the consumer below releases a record.
            tx.send_record(&cancel, |r| *r = 3).unwrap();
            tx
        });

        thread::sleep(Duration::from_millis(20));
        match rx.poll(LONG) {
            Polled::Record(guard) => assert_eq!(*guard, 1),
            _ => panic!("expected the first record"),
        }
        let _tx = producer.join().unwrap();
        match rx.poll(LONG) {
            Polled::Record(guard) => assert_eq!(*guard, 2),
            _ => panic!("expected the second record"),
        }
        match rx.poll(LONG) {
            Polled::Record(guard) => assert_eq!(*guard, 3),
            _ => panic!("expected the third record"),
        };
    }

    #[test]
    fn canceled_producer_send_returns_canceled() {
        let cancel = CancelToken::new();
        let (mut tx, _rx) = stream_channel(1, || 0u32);
        tx.send_record(&cancel, |r| *r = 1).unwrap();
        cancel.cancel();
        // Free ring is empty and the token is set; must not block forever.
        assert_eq!(
            tx.send_record(&cancel, |r| *r = 2),
            Err(StreamError::Canceled)
        );
    }

    #[test]
    fn dropped_consumer_disconnects_producer() {
        let cancel = CancelToken::new();
        let (mut tx, rx) = stream_channel(1, || 0u32);
        tx.send_record(&cancel, |r| *r = 1).unwrap();
        drop(rx);
        assert_eq!(
            tx.send_record(&cancel, |r| *r = 2),
            Err(StreamError::Disconnected)
        );
    }

    #[test]
    fn dropped_producer_drains_then_disconnects() {
        let cancel = CancelToken::new();
        let (mut tx, mut rx) = stream_channel(2, || 0u32);
        tx.send_record(&cancel, |r| *r = 9).unwrap();
        tx.send_signal(StreamSignal::Exit, &cancel).unwrap();
        drop(tx);

        match rx.poll(SHORT) {
            Polled::Record(guard) => assert_eq!(*guard, 9),
            _ => panic!("expected the queued record"),
        }
        assert!(matches!(rx.poll(SHORT), Polled::Signal(StreamSignal::Exit)));
        assert!(matches!(rx.poll(SHORT), Polled::Disconnected));
    }
}
