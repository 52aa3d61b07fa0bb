//! Conversion jobs and their lifecycle.
//!
//! A [`ConversionJob`] is immutable once created and is owned by the
//! dispatcher until exactly one outcome has been produced for it.
//!
//! ```text
//! Queued ──▶ Admitted ──▶ Running ──▶ Succeeded
//!   │           │            ├──────▶ Failed
//!   │           │            ├──────▶ TimedOut
//!   └───────────┴────────────┴──────▶ Cancelled
//! ```
//!
//! `Queued` and `Admitted` may also end directly in `Failed` (gate wait
//! exhausted, model unavailable) or `TimedOut`. Terminal states are final;
//! [`JobTracker`] refuses any move out of them.

use crate::progress::Observer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identifier of one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One request to convert a document.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    id: JobId,
    source: Arc<[u8]>,
    submitted_at: Instant,
    deadline: Option<Duration>,
    label: Option<String>,
}

impl ConversionJob {
    /// Create a job from the raw document bytes. The submission clock starts now.
    pub fn new(source: impl Into<Arc<[u8]>>) -> Self {
        Self {
            id: JobId::new(),
            source: source.into(),
            submitted_at: Instant::now(),
            deadline: None,
            label: None,
        }
    }

    /// Override the dispatcher's per-job deadline for this job only.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a human-readable label (file name, URL) used in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn source(&self) -> &Arc<[u8]> {
        &self.source
    }

    pub fn byte_len(&self) -> usize {
        self.source.len()
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("<bytes>")
    }

    /// The job's own deadline, or `default` when none was set.
    pub fn deadline_or(&self, default: Duration) -> Duration {
        self.deadline.unwrap_or(default)
    }

    /// Absolute instant at which the job is abandoned.
    pub fn deadline_at(&self, default: Duration) -> Instant {
        self.submitted_at + self.deadline_or(default)
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Admitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Admitted) => true,
            (Admitted, Running) => true,
            (Running, Succeeded) => true,
            (Queued | Admitted | Running, Failed | TimedOut | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Admitted => "admitted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Enforces the lifecycle of one job and reports each move to the observer.
///
/// Shared (`Arc`) between the dispatcher and the job's guarded task, so a
/// task that keeps running after its job was abandoned cannot move it back
/// out of a terminal state.
pub struct JobTracker {
    id: JobId,
    state: Mutex<JobState>,
    observer: Observer,
}

impl JobTracker {
    pub fn new(id: JobId, observer: Observer) -> Self {
        Self {
            id,
            state: Mutex::new(JobState::Queued),
            observer,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`. Returns `false` (and changes nothing) if the edge
    /// does not exist, e.g. because the job already finished.
    pub fn advance(&self, next: JobState) -> bool {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let from = *state;
            if !from.can_transition_to(next) {
                if from.is_terminal() {
                    debug!(job = %self.id, state = %from, refused = %next, "transition after terminal state ignored");
                } else {
                    warn!(job = %self.id, state = %from, refused = %next, "invalid job transition");
                }
                return false;
            }
            *state = next;
            from
        };
        debug!(job = %self.id, from = %from, to = %next, "job transition");
        self.observer.on_transition(self.id, from, next);
        true
    }
}

impl fmt::Debug for JobTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTracker")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
