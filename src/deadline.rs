//! Deadline and cancellation enforcement for one unit of work.
//!
//! The work runs as its own tokio task with a child [`CancellationToken`].
//! The guard races three things: completion, the deadline, and the caller's
//! token. When the deadline or the caller wins, the guard returns at once.
//! Cleanup continues in a detached task: the child token is cancelled so the
//! work can stop cooperatively, the task gets at most `grace` to do so, and
//! then it is aborted.
//!
//! A `hold` value travels with the work and is dropped only once the work
//! has stopped or been aborted. The dispatcher passes its gate token here,
//! so a slot is never handed to the next job while abandoned work still
//! runs, and is always back within `grace` of the deadline.

use std::future::Future;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a guarded run ended.
#[derive(Debug)]
pub enum Guarded<T> {
    Completed(T),
    /// The deadline passed first. `after` is the time the work was given.
    TimedOut { after: Duration },
    /// The caller's token fired first.
    Cancelled,
    /// The work panicked; the message is best effort.
    Panicked(String),
}

/// Runs work under a deadline with bounded cleanup.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineGuard {
    grace: Duration,
}

impl DeadlineGuard {
    /// `grace` bounds how long an abandoned run may take to stop.
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Run `work` until it finishes, `deadline` passes, or `cancel` fires,
    /// whichever comes first.
    ///
    /// `work` receives a token that is cancelled when the run is abandoned.
    /// `hold` is dropped when the work is over: right away if it completed,
    /// otherwise after the background wind-down.
    pub async fn run<T, H, F, Fut>(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
        hold: H,
        work: F,
    ) -> Guarded<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        H: Send + 'static,
    {
        let started = Instant::now();
        let child = cancel.child_token();
        let mut task = tokio::spawn(work(child.clone()));
        let mut abandon = AbandonOnDrop {
            token: child.clone(),
            abort: Some(task.abort_handle()),
        };

        let abandoned = tokio::select! {
            biased;
            joined = &mut task => {
                drop(hold);
                return finished(joined);
            }
            _ = cancel.cancelled() => Guarded::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Guarded::TimedOut {
                after: deadline.saturating_duration_since(started),
            },
        };

        child.cancel();
        abandon.disarm();
        let reason = match abandoned {
            Guarded::TimedOut { .. } => "deadline",
            _ => "cancellation",
        };
        tokio::spawn(wind_down(task, hold, self.grace, reason));
        abandoned
    }
}

/// Give abandoned work `grace` to stop, abort it otherwise, then drop `hold`.
async fn wind_down<T, H>(mut task: JoinHandle<T>, hold: H, grace: Duration, reason: &'static str) {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(_) => debug!(reason, "abandoned work stopped within grace period"),
        Err(_) => {
            warn!(
                reason,
                grace_ms = grace.as_millis() as u64,
                "abandoned work ignored cancellation, aborting"
            );
            task.abort();
            let _ = task.await;
        }
    }
    drop(hold);
}

/// Stops the work if the `run` future itself is dropped mid-flight.
/// Harmless once the task has finished.
struct AbandonOnDrop {
    token: CancellationToken,
    abort: Option<AbortHandle>,
}

impl AbandonOnDrop {
    /// Hand the task over to the background wind-down.
    fn disarm(&mut self) {
        self.abort = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            self.token.cancel();
            abort.abort();
        }
    }
}

fn finished<T>(joined: Result<T, tokio::task::JoinError>) -> Guarded<T> {
    match joined {
        Ok(value) => Guarded::Completed(value),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Guarded::Panicked(msg)
        }
        Err(e) => Guarded::Panicked(format!("task aborted: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn guard() -> DeadlineGuard {
        DeadlineGuard::new(Duration::from_millis(50))
    }

    fn in_ms(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    async fn released_within(hold: &Arc<()>, limit: Duration) -> bool {
        let until = Instant::now() + limit;
        while Instant::now() < until {
            if Arc::strong_count(hold) == 1 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Arc::strong_count(hold) == 1
    }

    #[tokio::test]
    async fn completes_before_deadline() {
        let hold = Arc::new(());
        let out = guard()
            .run(in_ms(500), &CancellationToken::new(), Arc::clone(&hold), |_| async { 7 })
            .await;
        assert!(matches!(out, Guarded::Completed(7)));
        assert_eq!(Arc::strong_count(&hold), 1);
    }

    #[tokio::test]
    async fn deadline_cancels_child_token() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_cancel);
        let out = guard()
            .run(in_ms(20), &CancellationToken::new(), (), move |token| async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            })
            .await;
        assert!(matches!(out, Guarded::TimedOut { .. }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timeout_returns_without_waiting_for_grace() {
        let g = DeadlineGuard::new(Duration::from_secs(3));
        let hold = Arc::new(());
        let started = Instant::now();
        let out = g
            .run(in_ms(20), &CancellationToken::new(), Arc::clone(&hold), |_| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
            })
            .await;

        assert!(matches!(out, Guarded::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_millis(250), "{:?}", started.elapsed());
        // The work is still winding down, so the hold is still out.
        assert_eq!(Arc::strong_count(&hold), 2);
        assert!(released_within(&hold, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn uncooperative_work_is_aborted_after_grace() {
        let alive = Arc::new(());
        let held = Arc::clone(&alive);
        let hold = Arc::new(());
        let out = guard()
            .run(in_ms(20), &CancellationToken::new(), Arc::clone(&hold), move |_| async move {
                let _held = held;
                tokio::time::sleep(Duration::from_secs(30)).await;
            })
            .await;
        assert!(matches!(out, Guarded::TimedOut { .. }));
        assert!(released_within(&hold, Duration::from_secs(2)).await);
        assert_eq!(Arc::strong_count(&alive), 1);
    }

    #[tokio::test]
    async fn caller_cancellation_wins() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let out = guard()
            .run(in_ms(5_000), &token, (), |t| async move { t.cancelled().await })
            .await;
        assert!(matches!(out, Guarded::Cancelled));
    }

    #[tokio::test]
    async fn dropping_the_run_stops_the_work() {
        let alive = Arc::new(AtomicBool::new(true));
        let held = Arc::clone(&alive);
        let token = CancellationToken::new();
        let g = guard();
        let run = g.run(in_ms(5_000), &token, (), move |_| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            held.store(false, Ordering::SeqCst);
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), run).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The aborted task dropped its clone without finishing.
        assert_eq!(Arc::strong_count(&alive), 1);
        assert!(alive.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let out: Guarded<()> = guard()
            .run(in_ms(500), &CancellationToken::new(), (), |_| async { panic!("boom") })
            .await;
        assert!(matches!(out, Guarded::Panicked(ref m) if m == "boom"));
    }
}
