use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::pipeline::error::ProcessingError;
use crate::pipeline::orchestrator::{JobRunner, ProcessingResult};
use crate::pipeline::request::ProcessingRequest;

const SUMMARY_ERROR_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchPhase {
    Idle,
    Running,
    Cancelled,
    Completed,
}

impl BatchPhase {
    pub fn can_transition_to(self, next: Self) -> bool {
        use BatchPhase::{Cancelled, Completed, Idle, Running};

        matches!(
            (self, next),
            (Idle, Running) | (Running, Cancelled) | (Running, Completed)
        )
    }
}

/// Advisory stop signal, checked before each batch item starts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub index: usize,
    pub total: usize,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItemError {
    pub filename: String,
    pub error: ProcessingError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed_count: usize,
    pub total: usize,
    pub errors: Vec<BatchItemError>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn summary_message(&self) -> String {
        let mut message = if self.cancelled {
            format!(
                "Batch cancelled. Processed {} of {} images.",
                self.processed_count, self.total
            )
        } else {
            format!(
                "Batch complete. Processed {} of {} images.",
                self.processed_count, self.total
            )
        };
        if self.errors.is_empty() {
            return message;
        }
        message.push_str(format!("\n{} errors:", self.errors.len()).as_str());
        for item in self.errors.iter().take(SUMMARY_ERROR_LIMIT) {
            message.push_str(format!("\n{}: {}", item.filename, item.error).as_str());
        }
        if self.errors.len() > SUMMARY_ERROR_LIMIT {
            message.push_str(
                format!(
                    "\n...and {} more errors.",
                    self.errors.len() - SUMMARY_ERROR_LIMIT
                )
                .as_str(),
            );
        }
        message
    }
}

/// Mutable per-batch bookkeeping. Exclusively owned by the coordinator loop.
#[derive(Debug)]
struct BatchState {
    phase: BatchPhase,
    current_index: Option<usize>,
    processed_count: usize,
    errors: Vec<BatchItemError>,
}

impl BatchState {
    fn new() -> Self {
        Self {
            phase: BatchPhase::Idle,
            current_index: None,
            processed_count: 0,
            errors: Vec::new(),
        }
    }

    fn transition(&mut self, next: BatchPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal batch transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    fn record(&mut self, index: usize, filename: String, result: ProcessingResult) {
        self.current_index = Some(index);
        match result {
            Ok(_) => self.processed_count += 1,
            Err(error) => {
                warn!(file = filename.as_str(), code = error.code(), error = %error, "batch item failed");
                self.errors.push(BatchItemError { filename, error });
            }
        }
        debug_assert!(
            self.processed_count + self.errors.len() <= self.current_index.map_or(0, |i| i + 1)
        );
    }

    fn into_report(self, total: usize) -> BatchReport {
        BatchReport {
            processed_count: self.processed_count,
            total,
            errors: self.errors,
            cancelled: self.phase == BatchPhase::Cancelled,
        }
    }
}

/// Runs requests strictly in order; one failing item never stops the rest.
pub struct BatchCoordinator<J: JobRunner> {
    jobs: Arc<J>,
}

impl<J: JobRunner> Clone for BatchCoordinator<J> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<J: JobRunner> BatchCoordinator<J> {
    pub fn new(jobs: Arc<J>) -> Self {
        Self { jobs }
    }

    pub fn run_batch(
        &self,
        requests: &[ProcessingRequest],
        mut on_progress: impl FnMut(BatchProgress),
        cancel: &CancelFlag,
    ) -> BatchReport {
        let total = requests.len();
        let mut state = BatchState::new();
        state.transition(BatchPhase::Running);
        info!(total, "batch started");

        for (index, request) in requests.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(index, total, "batch cancelled before item");
                state.transition(BatchPhase::Cancelled);
                break;
            }
            let filename = request.display_name();
            let result = run_isolated(self.jobs.as_ref(), request);
            state.record(index, filename.clone(), result);
            on_progress(BatchProgress {
                index,
                total,
                filename,
            });
        }
        if state.phase == BatchPhase::Running {
            state.transition(BatchPhase::Completed);
        }

        let report = state.into_report(total);
        info!(
            processed = report.processed_count,
            failed = report.errors.len(),
            total,
            cancelled = report.cancelled,
            "batch finished"
        );
        report
    }
}

fn run_isolated<J: JobRunner>(jobs: &J, request: &ProcessingRequest) -> ProcessingResult {
    panic::catch_unwind(AssertUnwindSafe(|| jobs.run_job(request))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| String::from("job panicked"));
        Err(ProcessingError::Internal {
            message: format!("job panicked: {message}"),
        })
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Progress(BatchProgress),
    Finished(BatchReport),
}

/// Runs the batch on the blocking pool. Progress and the single final report
/// arrive on the returned channel; the caller never blocks on engine work.
pub fn spawn_batch<J: JobRunner>(
    coordinator: BatchCoordinator<J>,
    requests: Vec<ProcessingRequest>,
    cancel: CancelFlag,
) -> (UnboundedReceiver<BatchEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::task::spawn_blocking(move || {
        let progress_tx = tx.clone();
        let report = coordinator.run_batch(
            requests.as_slice(),
            |progress| {
                let _ = progress_tx.send(BatchEvent::Progress(progress));
            },
            &cancel,
        );
        let _ = tx.send(BatchEvent::Finished(report));
    });
    (rx, handle)
}

/// Single-job counterpart of [`spawn_batch`].
pub fn spawn_job<J: JobRunner>(
    jobs: Arc<J>,
    request: ProcessingRequest,
) -> JoinHandle<ProcessingResult> {
    tokio::task::spawn_blocking(move || run_isolated(jobs.as_ref(), &request))
}
