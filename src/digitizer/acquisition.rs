//! Acquisition Buffer Manager.
//!
//! Owns the DMA buffer pool, cycles buffers through the digitizer, and emits
//! real-time records into the pipeline. The stage is a small state machine:
//!
//! ```text
//! idle --resume--> streaming --pause/length-reached--> idle
//!                     |  ^
//!              overrun|  |capture restarted (epoch + 1)
//!                     v  |
//!               overrun-draining
//! ```
//!
//! In steady state the manager waits on the oldest posted buffer, copies the
//! completed samples into the next output record, and re-posts the buffer.
//! A re-post failing with the overrun condition specifically switches the
//! stage into draining: the buffers still in flight are collected without
//! re-posting until every pool buffer has been collected once in the current
//! capture epoch, then capture is restarted from scratch under a fresh epoch
//! number. The chunk counter is never reset, so downstream consumers see a
//! monotonic record sequence across restarts.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::DigitizerConfig;
use crate::data::RealTimeRecord;
use crate::error::{AppResult, DaqError};
use crate::pipeline::{CancelToken, Instruction, PipelineStage, StageContext};
use crate::stream::{StreamProducer, StreamSignal};

use super::{BufferHandle, CaptureParams, DigitizerDriver, DriverError};

/// Sleep between instruction polls while idle.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Externally visible run status, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// No acquisition in progress.
    Idle,
    /// An acquisition run is streaming.
    Running,
    /// The configured acquisition length was reached.
    Complete,
}

/// Run-controller handle the acquisition stage reports through.
pub struct RunControl {
    tx: watch::Sender<RunStatus>,
}

impl RunControl {
    /// Create the control handle plus the receiver the controller watches.
    pub fn new() -> (Self, watch::Receiver<RunStatus>) {
        let (tx, rx) = watch::channel(RunStatus::Idle);
        (Self { tx }, rx)
    }

    fn set(&self, status: RunStatus) {
        // A controller that stopped watching is not an error.
        let _ = self.tx.send(status);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Idle,
    Streaming,
}

/// Pipeline stage that owns the digitizer and its DMA buffer pool.
pub struct AcquisitionManager<D: DigitizerDriver> {
    config: DigitizerConfig,
    driver: D,
    output: StreamProducer<RealTimeRecord>,
    run_control: RunControl,
    state: ManagerState,
    buffers: Vec<Vec<u16>>,
    in_flight: VecDeque<usize>,
    collected_in_epoch: Vec<bool>,
    chunk_counter: u64,
    epoch: u32,
    produced_in_run: u64,
}

impl<D: DigitizerDriver> AcquisitionManager<D> {
    /// Create the stage. Buffers are allocated on the first `resume`.
    pub fn new(
        config: DigitizerConfig,
        driver: D,
        output: StreamProducer<RealTimeRecord>,
        run_control: RunControl,
    ) -> Self {
        Self {
            config,
            driver,
            output,
            run_control,
            state: ManagerState::Idle,
            buffers: Vec::new(),
            in_flight: VecDeque::new(),
            collected_in_epoch: Vec::new(),
            chunk_counter: 0,
            epoch: 0,
            produced_in_run: 0,
        }
    }

    /// Capture-epoch counter; increments on every overrun restart.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Next chunk sequence number to be assigned.
    pub fn chunk_counter(&self) -> u64 {
        self.chunk_counter
    }

    fn capture_params(&self) -> CaptureParams {
        CaptureParams {
            sample_rate: self.config.samples_per_sec,
            input_range_volts: self.config.input_range_volts,
            trigger: self.config.trigger,
            decimation: self.config.decimation_factor,
        }
    }

    /// Allocate (or reuse) the pool, program the board, post every buffer,
    /// and start capturing.
    fn arm(&mut self, cancel: &CancelToken) -> AppResult<()> {
        let count = self.config.dma_buffer_count;
        if self.buffers.len() != count {
            self.buffers = vec![vec![0u16; self.config.samples_per_buffer]; count];
        }
        self.collected_in_epoch = vec![false; count];
        self.in_flight.clear();

        self.driver.configure(&self.capture_params())?;
        for index in 0..count {
            self.driver.post_buffer(BufferHandle::new(index))?;
            self.in_flight.push_back(index);
        }
        self.driver.start_capture()?;
        self.produced_in_run = 0;

        match self.output.send_signal(StreamSignal::Start, cancel) {
            Ok(()) => {}
            Err(err) if err.is_cancellation() => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        self.run_control.set(RunStatus::Running);
        self.state = ManagerState::Streaming;
        info!(
            buffers = count,
            bytes_per_buffer = self.config.bytes_per_buffer(),
            buffers_per_acquisition = self.config.buffers_per_acquisition(),
            "acquisition armed and streaming"
        );
        Ok(())
    }

    /// Wait on the oldest in-flight buffer and emit its contents as the next
    /// record. Returns the collected pool index.
    fn collect_oldest(&mut self, cancel: &CancelToken) -> AppResult<usize> {
        let index = match self.in_flight.front() {
            Some(&index) => index,
            None => {
                return Err(DaqError::Processing("no buffers in flight".to_string()));
            }
        };
        let timeout = self.config.wait_timeout();
        // A wait longer than a few buffer periods means the hardware stopped
        // triggering; that is fatal, not a retry.
        self.driver
            .wait_buffer_ready(BufferHandle::new(index), &mut self.buffers[index], timeout)?;
        self.in_flight.pop_front();
        self.collected_in_epoch[index] = true;

        let chunk = self.chunk_counter;
        let dynamic_range = self.config.input_range_volts;
        let samples = &self.buffers[index];
        let sent = self.output.send_record(cancel, |record| {
            if record.is_empty() {
                let _ = record.allocate(samples.len());
            }
            record.samples_mut().copy_from_slice(samples);
            record.set_dynamic_range(dynamic_range);
            record.set_chunk_counter(chunk);
        });
        match sent {
            Ok(()) => {}
            // Cancellation mid-send drops the buffer copy; the loop exits
            // at its next iteration.
            Err(err) if err.is_cancellation() => return Ok(index),
            Err(err) => return Err(err.into()),
        }
        self.chunk_counter += 1;
        self.produced_in_run += 1;
        Ok(index)
    }

    /// One streaming iteration: collect, check run completion, re-post.
    fn streaming_step(&mut self, cancel: &CancelToken) -> AppResult<()> {
        let index = self.collect_oldest(cancel)?;

        if self.produced_in_run >= self.config.buffers_per_acquisition() {
            info!(
                buffers = self.produced_in_run,
                "acquisition length reached; ending run"
            );
            self.finish_run(cancel, RunStatus::Complete)?;
            return Ok(());
        }

        match self.driver.post_buffer(BufferHandle::new(index)) {
            Ok(()) => {
                self.in_flight.push_back(index);
                Ok(())
            }
            Err(DriverError::Overrun) => {
                warn!(
                    chunk = self.chunk_counter,
                    "buffer overrun on re-post; draining in-flight buffers"
                );
                self.drain_and_restart(cancel)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Overrun recovery: collect the in-flight buffers that have not yet
    /// completed this epoch, then restart capture under a fresh epoch.
    fn drain_and_restart(&mut self, cancel: &CancelToken) -> AppResult<()> {
        let mut drained = 0u32;
        while let Some(&index) = self.in_flight.front() {
            if cancel.is_canceled() {
                return Ok(());
            }
            if self.collected_in_epoch[index] {
                // Re-posted before the overrun hit; the capture restart
                // below reclaims it without another wait.
                self.in_flight.pop_front();
                continue;
            }
            self.collect_oldest(cancel)?;
            drained += 1;

            if self.produced_in_run >= self.config.buffers_per_acquisition() {
                info!("acquisition length reached while draining; ending run");
                return self.finish_run(cancel, RunStatus::Complete);
            }
        }
        debug!(drained, "in-flight buffers drained after overrun");

        self.driver.abort()?;
        self.epoch += 1;
        for collected in &mut self.collected_in_epoch {
            *collected = false;
        }
        for index in 0..self.config.dma_buffer_count {
            self.driver.post_buffer(BufferHandle::new(index))?;
            self.in_flight.push_back(index);
        }
        self.driver.start_capture()?;
        info!(epoch = self.epoch, "capture restarted after overrun");
        Ok(())
    }

    /// End the current run: propagate `stop`, abort the board, go idle.
    fn finish_run(&mut self, cancel: &CancelToken, status: RunStatus) -> AppResult<()> {
        match self.output.send_signal(StreamSignal::Stop, cancel) {
            Ok(()) => {}
            Err(err) if err.is_cancellation() => {}
            Err(err) => return Err(err.into()),
        }
        // Abort is idempotent; a pause racing natural completion is safe.
        self.driver.abort()?;
        self.in_flight.clear();
        self.run_control.set(status);
        self.state = ManagerState::Idle;
        Ok(())
    }
}

impl<D: DigitizerDriver> PipelineStage for AcquisitionManager<D> {
    fn name(&self) -> &'static str {
        "acquisition"
    }

    fn execute(&mut self, ctx: &mut StageContext) -> AppResult<()> {
        while !ctx.is_canceled() {
            match ctx.latest_instruction() {
                Some(Instruction::Resume) => match self.state {
                    ManagerState::Idle => self.arm(ctx.cancel_token())?,
                    ManagerState::Streaming => {
                        debug!("resume while already streaming ignored");
                    }
                },
                Some(Instruction::Pause) => match self.state {
                    ManagerState::Streaming => {
                        info!("pause requested; stopping run");
                        self.finish_run(ctx.cancel_token(), RunStatus::Idle)?;
                    }
                    ManagerState::Idle => {
                        debug!("pause while idle ignored");
                    }
                },
                None => {}
            }

            match self.state {
                ManagerState::Idle => thread::sleep(IDLE_POLL),
                ManagerState::Streaming => self.streaming_step(ctx.cancel_token())?,
            }
        }

        // Best-effort teardown signaling on cancellation.
        if self.state == ManagerState::Streaming {
            let _ = self.output.send_signal(StreamSignal::Stop, ctx.cancel_token());
            let _ = self.driver.abort();
            self.state = ManagerState::Idle;
        }
        let _ = self.output.send_signal(StreamSignal::Exit, ctx.cancel_token());
        Ok(())
    }

    fn finalize(&mut self) {
        // Abort during teardown must not raise, even when already idle.
        let _ = self.driver.abort();
        self.buffers.clear();
        self.in_flight.clear();
    }
}
