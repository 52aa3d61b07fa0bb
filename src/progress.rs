//! Observer trait for job lifecycle events.
//!
//! Pass an [`Arc<dyn DispatchObserver>`] to
//! [`crate::Dispatcher::with_observer`] to receive events as jobs move
//! through the dispatcher. Callers can forward them to a metrics sink, a
//! broadcast channel, or a terminal progress bar without the library
//! knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_dispatch::{ConversionOutcome, DispatchObserver, JobId};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct FinishedCounter(AtomicUsize);
//!
//! impl DispatchObserver for FinishedCounter {
//!     fn on_job_finished(&self, _job: JobId, _outcome: &ConversionOutcome) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::job::{JobId, JobState};
use crate::output::ConversionOutcome;
use std::sync::Arc;

/// Called by the dispatcher as jobs progress.
///
/// Jobs run concurrently, so every method may be called from several
/// threads at once. All methods default to no-ops.
pub trait DispatchObserver: Send + Sync {
    /// Called once when a job enters the dispatcher.
    ///
    /// # Arguments
    /// * `job`     : the job's id
    /// * `label`   : file name or URL, `"<bytes>"` if none was given
    /// * `byte_len`: size of the submitted document
    fn on_job_queued(&self, job: JobId, label: &str, byte_len: usize) {
        let _ = (job, label, byte_len);
    }

    /// Called on every accepted lifecycle transition.
    fn on_transition(&self, job: JobId, from: JobState, to: JobState) {
        let _ = (job, from, to);
    }

    /// Called exactly once per job, with its terminal outcome.
    fn on_job_finished(&self, job: JobId, outcome: &ConversionOutcome) {
        let _ = (job, outcome);
    }
}

/// A no-op implementation for callers that don't need events.
///
/// This is the default when no observer is configured.
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {}

/// Convenience alias for the type stored by the dispatcher.
pub type Observer = Arc<dyn DispatchObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        queued: AtomicUsize,
        transitions: Mutex<Vec<(JobState, JobState)>>,
        finished: AtomicUsize,
    }

    impl DispatchObserver for Recording {
        fn on_job_queued(&self, _job: JobId, _label: &str, _byte_len: usize) {
            self.queued.fetch_add(1, Ordering::SeqCst);
        }

        fn on_transition(&self, _job: JobId, from: JobState, to: JobState) {
            self.transitions.lock().unwrap().push((from, to));
        }

        fn on_job_finished(&self, _job: JobId, _outcome: &ConversionOutcome) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let obs = NoopObserver;
        let id = JobId::new();
        obs.on_job_queued(id, "a.pdf", 10);
        obs.on_transition(id, JobState::Queued, JobState::Admitted);
        obs.on_job_finished(id, &ConversionOutcome::Cancelled);
    }

    #[test]
    fn recording_observer_receives_events() {
        let rec = Recording::default();
        let id = JobId::new();
        rec.on_job_queued(id, "a.pdf", 10);
        rec.on_transition(id, JobState::Queued, JobState::Admitted);
        rec.on_transition(id, JobState::Admitted, JobState::Running);
        rec.on_job_finished(id, &ConversionOutcome::Cancelled);

        assert_eq!(rec.queued.load(Ordering::SeqCst), 1);
        assert_eq!(rec.transitions.lock().unwrap().len(), 2);
        assert_eq!(rec.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_observer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn DispatchObserver>();
        let obs: Observer = Arc::new(NoopObserver);
        obs.on_job_queued(JobId::new(), "x", 0);
    }
}
