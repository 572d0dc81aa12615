//! Minimal node-graph execution substrate.
//!
//! Every pipeline stage runs on its own dedicated thread and talks to its
//! neighbors only through the [`crate::stream`] channels wired in at
//! construction time. This module supplies the stage lifecycle contract
//! (`initialize` → `execute` → `finalize`), the process-wide cancellation
//! token, and the per-stage instruction mailbox.
//!
//! A stage returning an error is treated as a hard failure: it is logged
//! with the stage name and the whole pipeline is canceled rather than left
//! partially running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{AppResult, DaqError};

/// Capacity of each stage's instruction mailbox.
const MAILBOX_DEPTH: usize = 8;

/// Process-wide cancellation flag shared by every stage.
///
/// Stages poll the token once per loop iteration and exit promptly once it
/// is set; setting it is idempotent.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of everything sharing this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// True once cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Out-of-band command delivered to a stage between records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Stop the current session and return to idle.
    Pause,
    /// Begin (or resume) a session from idle.
    Resume,
}

/// Per-stage runtime context: the cancellation token plus the instruction
/// mailbox, handed to `execute`.
pub struct StageContext {
    cancel: CancelToken,
    instructions: mpsc::Receiver<Instruction>,
}

impl StageContext {
    /// True once pipeline cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// The shared cancellation token, for blocking stream operations.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Drain the mailbox and return the most recent instruction, if any.
    ///
    /// Instructions carry no ordering guarantee beyond latest-wins; stages
    /// already ignore no-op transitions.
    pub fn latest_instruction(&mut self) -> Option<Instruction> {
        let mut latest = None;
        while let Ok(instruction) = self.instructions.try_recv() {
            latest = Some(instruction);
        }
        latest
    }
}

/// Lifecycle contract every pipeline node satisfies.
pub trait PipelineStage: Send {
    /// Stable stage name used for thread naming and error reporting.
    fn name(&self) -> &'static str;

    /// One-time setup before the processing loop. Configuration errors are
    /// raised here, before any hardware I/O.
    fn initialize(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// The stage's processing loop. Returns when the input stream exits,
    /// the pipeline is canceled, or a fatal error occurs.
    fn execute(&mut self, ctx: &mut StageContext) -> AppResult<()>;

    /// Teardown; always runs, even after a failed `initialize` or `execute`.
    fn finalize(&mut self) {}
}

/// Handle for delivering instructions to one stage from the control plane.
pub type InstructionSender = mpsc::Sender<Instruction>;

/// Owns the stage set and drives one thread per stage.
#[derive(Default)]
pub struct Pipeline {
    cancel: CancelToken,
    stages: Vec<(Box<dyn PipelineStage>, StageContext)>,
}

impl Pipeline {
    /// Create an empty pipeline with a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// The token that cancels every stage of this pipeline.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Register a stage and return the sender half of its instruction
    /// mailbox.
    pub fn add_stage(&mut self, stage: Box<dyn PipelineStage>) -> InstructionSender {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let ctx = StageContext {
            cancel: self.cancel.clone(),
            instructions: rx,
        };
        self.stages.push((stage, ctx));
        tx
    }

    /// Run every stage to completion on its own named thread.
    ///
    /// Blocks until all stage threads have joined. Returns the first stage
    /// failure, if any; a failing stage cancels the rest of the pipeline.
    pub fn run(self) -> AppResult<()> {
        let mut handles = Vec::with_capacity(self.stages.len());
        for (stage, ctx) in self.stages {
            let cancel = self.cancel.clone();
            let handle = thread::Builder::new()
                .name(stage.name().to_string())
                .spawn(move || run_stage(stage, ctx, cancel))?;
            handles.push(handle);
        }

        let mut first_failure = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_failure.get_or_insert(err);
                }
                Err(_) => {
                    self.cancel.cancel();
                    first_failure
                        .get_or_insert(DaqError::Processing("stage thread panicked".to_string()));
                }
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Build a standalone context for driving a stage by hand in unit tests.
#[cfg(test)]
pub(crate) fn test_context() -> (StageContext, InstructionSender) {
    let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
    let ctx = StageContext {
        cancel: CancelToken::new(),
        instructions: rx,
    };
    (ctx, tx)
}

fn run_stage(
    mut stage: Box<dyn PipelineStage>,
    mut ctx: StageContext,
    cancel: CancelToken,
) -> AppResult<()> {
    let name = stage.name();
    let result = stage
        .initialize()
        .and_then(|()| stage.execute(&mut ctx));
    stage.finalize();
    match result {
        Ok(()) => {
            debug!(stage = name, "stage completed");
            Ok(())
        }
        Err(DaqError::Stream(err)) if err.is_cancellation() && cancel.is_canceled() => {
            debug!(stage = name, "stage interrupted by cancellation");
            Ok(())
        }
        Err(err) => {
            let err = err.in_stage(name);
            error!(stage = name, error = %err, "stage failed; canceling pipeline");
            cancel.cancel();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountUntilCanceled {
        count: Arc<AtomicUsize>,
        finalized: Arc<AtomicBool>,
    }

    impl PipelineStage for CountUntilCanceled {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn execute(&mut self, ctx: &mut StageContext) -> AppResult<()> {
            while !ctx.is_canceled() {
                self.count.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }

        fn finalize(&mut self) {
            self.finalized.store(true, Ordering::Release);
        }
    }

    struct FailsImmediately;

    impl PipelineStage for FailsImmediately {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn execute(&mut self, _ctx: &mut StageContext) -> AppResult<()> {
            Err(DaqError::Processing("deliberate failure".to_string()))
        }
    }

    #[test]
    fn canceling_stops_all_stages_and_finalizes() {
        let count = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicBool::new(false));

        let mut pipeline = Pipeline::new();
        pipeline.add_stage(Box::new(CountUntilCanceled {
            count: Arc::clone(&count),
            finalized: Arc::clone(&finalized),
        }));
        let cancel = pipeline.cancel_token();

        let runner = thread::spawn(move || pipeline.run());
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        runner.join().unwrap().unwrap();

        assert!(count.load(Ordering::Relaxed) > 0);
        assert!(finalized.load(Ordering::Acquire));
    }

    #[test]
    fn failing_stage_cancels_the_rest_and_reports_its_name() {
        let count = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicBool::new(false));

        let mut pipeline = Pipeline::new();
        pipeline.add_stage(Box::new(CountUntilCanceled {
            count: Arc::clone(&count),
            finalized: Arc::clone(&finalized),
        }));
        pipeline.add_stage(Box::new(FailsImmediately));

        let err = pipeline.run().unwrap_err();
        match err {
            DaqError::Stage { stage, .. } => assert_eq!(stage, "broken"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(finalized.load(Ordering::Acquire));
    }

    #[test]
    fn latest_instruction_wins() {
        let mut pipeline = Pipeline::new();
        struct Nop;
        impl PipelineStage for Nop {
            fn name(&self) -> &'static str {
                "nop"
            }
            fn execute(&mut self, _ctx: &mut StageContext) -> AppResult<()> {
                Ok(())
            }
        }
        let tx = pipeline.add_stage(Box::new(Nop));
        tx.try_send(Instruction::Resume).unwrap();
        tx.try_send(Instruction::Pause).unwrap();

        // Reach into the registered context to drain the mailbox.
        let (_, ctx) = &mut pipeline.stages[0];
        assert_eq!(ctx.latest_instruction(), Some(Instruction::Pause));
        assert_eq!(ctx.latest_instruction(), None);
    }
}
