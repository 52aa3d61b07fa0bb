//! The dispatcher: accepts jobs, admits them through the gate, runs the
//! pipeline under a deadline, and reports one outcome per job.
//!
//! ## Job flow
//!
//! ```text
//! submit ─▶ Queued ─▶ gate.acquire(deadline) ─▶ Admitted
//!                                                  │
//!                   DeadlineGuard::run ◀───────────┘
//!                     ├─ ModelHandle::initialize (lazy mode pays here)
//!                     ├─ Running
//!                     └─ ConversionPipeline::execute
//!                                                  │
//!   outcome (slot freed when the work has ended) ◀──┘
//!                     │
//!                     ▼
//!   Succeeded | Failed | TimedOut | Cancelled ─▶ observer.on_job_finished
//! ```
//!
//! The dispatcher hands its [`GateToken`] to the guard, not to the task.
//! A finished or panicked run returns the slot before the outcome is
//! reported. A timed-out or cancelled job reports at once, and its slot
//! comes back when the abandoned work stops, at most `cancel_grace` later.
//!
//! [`GateToken`]: crate::gate::GateToken

use crate::config::{DispatcherConfig, InitMode};
use crate::deadline::{DeadlineGuard, Guarded};
use crate::error::{DispatchError, ErrorKind};
use crate::gate::ResourceGate;
use crate::job::{ConversionJob, JobState, JobTracker};
use crate::model::{ModelHandle, ModelLoader};
use crate::output::{ConversionOutcome, ConversionStats};
use crate::pipeline::ConversionPipeline;
use crate::progress::{NoopObserver, Observer};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Process-wide conversion service. Share it behind an `Arc`.
pub struct Dispatcher {
    config: DispatcherConfig,
    models: Arc<ModelHandle>,
    gate: ResourceGate,
    guard: DeadlineGuard,
    pipeline: Arc<ConversionPipeline>,
    observer: Observer,
}

impl Dispatcher {
    /// Build a dispatcher without loading the model.
    pub fn new(config: DispatcherConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            models: Arc::new(ModelHandle::new(loader)),
            gate: ResourceGate::new(config.max_concurrent_conversions),
            guard: DeadlineGuard::new(config.cancel_grace),
            pipeline: Arc::new(ConversionPipeline::from_config(&config)),
            observer: Arc::new(NoopObserver),
            config,
        }
    }

    /// Build a dispatcher and, in [`InitMode::Eager`], load the model now.
    ///
    /// # Errors
    /// `ModelUnavailable` if the eager load fails. The process should not
    /// accept jobs in that case.
    pub async fn start(config: DispatcherConfig, loader: Arc<dyn ModelLoader>) -> Result<Self, DispatchError> {
        let dispatcher = Self::new(config, loader);
        info!(
            capacity = dispatcher.gate.capacity(),
            deadline_ms = dispatcher.config.per_job_deadline.as_millis() as u64,
            init = ?dispatcher.config.init_mode,
            "dispatcher starting"
        );
        if dispatcher.config.init_mode == InitMode::Eager {
            dispatcher.models.initialize().await?;
        }
        Ok(dispatcher)
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn models(&self) -> &Arc<ModelHandle> {
        &self.models
    }

    pub fn gate(&self) -> &ResourceGate {
        &self.gate
    }

    /// Stop admitting jobs. Waiting and later submissions end `Cancelled`;
    /// jobs already running finish normally.
    pub fn close(&self) {
        info!("dispatcher closed to new jobs");
        self.gate.close();
    }

    /// Convert `job` and wait for its outcome.
    pub async fn submit(&self, job: ConversionJob) -> ConversionOutcome {
        self.submit_with_cancel(job, CancellationToken::new()).await
    }

    /// Like [`submit`](Self::submit), abandoning the job when `cancel` fires.
    pub async fn submit_with_cancel(&self, job: ConversionJob, cancel: CancellationToken) -> ConversionOutcome {
        let id = job.id();
        let deadline_dur = job.deadline_or(self.config.per_job_deadline);
        let deadline = job.deadline_at(self.config.per_job_deadline);
        let tracker = Arc::new(JobTracker::new(id, Arc::clone(&self.observer)));

        info!(job = %id, label = job.label(), bytes = job.byte_len(), "job queued");
        self.observer.on_job_queued(id, job.label(), job.byte_len());

        let admitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.finish(&tracker, ConversionOutcome::Cancelled),
            acquired = self.gate.acquire(deadline) => acquired,
        };
        let token = match admitted {
            Ok(token) => token,
            Err(e) => {
                let e = DispatchError::from(e);
                let outcome = match e {
                    DispatchError::Cancelled => ConversionOutcome::Cancelled,
                    other => ConversionOutcome::failure(other.kind(), other.to_string()),
                };
                return self.finish(&tracker, outcome);
            }
        };

        let admitted_at = Instant::now();
        let queue_wait_ms = admitted_at.duration_since(job.submitted_at()).as_millis() as u64;
        tracker.advance(JobState::Admitted);

        let models = Arc::clone(&self.models);
        let pipeline = Arc::clone(&self.pipeline);
        let source = Arc::clone(job.source());
        let running = Arc::clone(&tracker);

        let guarded = self
            .guard
            .run(deadline, &cancel, token, move |stop| async move {
                models.initialize().await?;
                if !running.advance(JobState::Running) {
                    return Err(DispatchError::Cancelled);
                }
                pipeline.execute(&models, source, stop).await
            })
            .await;

        let run_ms = admitted_at.elapsed().as_millis() as u64;

        let outcome = match guarded {
            Guarded::Completed(Ok(result)) => {
                let stats = ConversionStats::for_result(&result, queue_wait_ms, run_ms);
                ConversionOutcome::Success { result, stats }
            }
            Guarded::Completed(Err(DispatchError::Cancelled)) | Guarded::Cancelled => ConversionOutcome::Cancelled,
            Guarded::Completed(Err(DispatchError::TimedOut { deadline_ms })) => {
                ConversionOutcome::TimedOut { deadline_ms }
            }
            Guarded::Completed(Err(e)) => ConversionOutcome::failure(e.kind(), e.to_string()),
            Guarded::TimedOut { .. } => ConversionOutcome::TimedOut {
                deadline_ms: deadline_dur.as_millis() as u64,
            },
            Guarded::Panicked(msg) => {
                error!(job = %id, "conversion panicked: {msg}");
                ConversionOutcome::failure(ErrorKind::Internal, format!("conversion panicked: {msg}"))
            }
        };

        self.finish(&tracker, outcome)
    }

    fn finish(&self, tracker: &JobTracker, outcome: ConversionOutcome) -> ConversionOutcome {
        let id = tracker.id();
        tracker.advance(outcome.terminal_state());

        match &outcome {
            ConversionOutcome::Success { stats, .. } => info!(
                job = %id,
                pages = stats.total_pages,
                ocr_pages = stats.ocr_pages,
                failed_pages = stats.failed_pages,
                queue_ms = stats.queue_wait_ms,
                run_ms = stats.run_ms,
                "job succeeded"
            ),
            ConversionOutcome::Failure { kind, message } => {
                warn!(job = %id, kind = %kind, "job failed: {message}")
            }
            ConversionOutcome::TimedOut { deadline_ms } => {
                warn!(job = %id, deadline_ms, "job exceeded its deadline")
            }
            ConversionOutcome::Cancelled => info!(job = %id, "job cancelled"),
        }

        self.observer.on_job_finished(id, &outcome);
        outcome
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("models", &self.models)
            .field("gate", &self.gate)
            .field("guard", &self.guard)
            .finish()
    }
}

/// A [`Dispatcher`] with its own runtime, for callers without one.
///
/// `submit` blocks the calling thread until the job's outcome is known.
/// It may be called from many threads at once.
pub struct BlockingDispatcher {
    runtime: tokio::runtime::Runtime,
    inner: Arc<Dispatcher>,
}

impl BlockingDispatcher {
    /// Build the runtime (`worker_count` threads) and start a dispatcher on it.
    pub fn start(config: DispatcherConfig, loader: Arc<dyn ModelLoader>) -> Result<Self, DispatchError> {
        Self::start_with_observer(config, loader, Arc::new(NoopObserver))
    }

    pub fn start_with_observer(
        config: DispatcherConfig,
        loader: Arc<dyn ModelLoader>,
        observer: Observer,
    ) -> Result<Self, DispatchError> {
        let runtime = config.build_runtime()?;
        let inner = runtime.block_on(Dispatcher::start(config, loader))?;
        Ok(Self {
            runtime,
            inner: Arc::new(inner.with_observer(observer)),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner
    }

    pub fn submit(&self, job: ConversionJob) -> ConversionOutcome {
        self.runtime.block_on(self.inner.submit(job))
    }

    pub fn submit_with_cancel(&self, job: ConversionJob, cancel: CancellationToken) -> ConversionOutcome {
        self.runtime.block_on(self.inner.submit_with_cancel(job, cancel))
    }
}

impl std::fmt::Debug for BlockingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingDispatcher").field("inner", &self.inner).finish()
    }
}
