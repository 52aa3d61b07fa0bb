//! Counting gate that bounds how many conversions hold the model at once.
//!
//! A [`GateToken`] is the only proof of admission. It returns its slot to
//! the gate exactly once: on [`GateToken::release`], or on drop if it was
//! never released explicitly. Dropping covers every early return, timeout
//! and panic unwind, so slots cannot leak.
//!
//! Waiters are admitted in arrival order (tokio's semaphore is fair).

use crate::error::GateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Live counters, shared between the gate and every token it issued.
#[derive(Debug, Default)]
pub struct GateStats {
    acquired: AtomicU64,
    released: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    wait_timeouts: AtomicU64,
    duplicate_releases: AtomicU64,
}

impl GateStats {
    fn on_acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn on_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time copy of [`GateStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSnapshot {
    pub capacity: usize,
    pub available: usize,
    pub acquired: u64,
    pub released: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub wait_timeouts: u64,
    pub duplicate_releases: u64,
}

/// Admission control with capacity `C`.
pub struct ResourceGate {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<GateStats>,
}

impl ResourceGate {
    /// Create a gate admitting at most `capacity` holders (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            stats: Arc::new(GateStats::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot until `deadline`.
    ///
    /// Dropping the returned future before it resolves gives up the place
    /// in the queue without consuming a slot.
    pub async fn acquire(&self, deadline: Instant) -> Result<GateToken, GateError> {
        let started = Instant::now();
        let permit = Arc::clone(&self.semaphore).acquire_owned();

        match tokio::time::timeout_at(deadline, permit).await {
            Ok(Ok(permit)) => {
                self.stats.on_acquire();
                debug!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    available = self.available(),
                    "gate slot acquired"
                );
                Ok(GateToken {
                    permit: Some(permit),
                    stats: Arc::clone(&self.stats),
                })
            }
            Ok(Err(_closed)) => Err(GateError::Closed),
            Err(_elapsed) => {
                self.stats.wait_timeouts.fetch_add(1, Ordering::SeqCst);
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, capacity = self.capacity, "gate wait exhausted");
                Err(GateError::TimedOutWaiting { waited_ms })
            }
        }
    }

    /// Return `token`'s slot. Same as dropping it, spelled out.
    pub fn release(&self, mut token: GateToken) {
        token.release();
    }

    /// Refuse all further admissions. Tokens already issued stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let s = &self.stats;
        GateSnapshot {
            capacity: self.capacity,
            available: self.available(),
            acquired: s.acquired.load(Ordering::SeqCst),
            released: s.released.load(Ordering::SeqCst),
            in_flight: s.in_flight.load(Ordering::SeqCst),
            peak_in_flight: s.peak_in_flight.load(Ordering::SeqCst),
            wait_timeouts: s.wait_timeouts.load(Ordering::SeqCst),
            duplicate_releases: s.duplicate_releases.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Debug for ResourceGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGate")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// One admitted slot.
#[must_use = "dropping a GateToken releases its slot immediately"]
pub struct GateToken {
    permit: Option<OwnedSemaphorePermit>,
    stats: Arc<GateStats>,
}

impl GateToken {
    /// Give the slot back. Returns `false` if it was already released;
    /// the duplicate is counted and has no effect.
    pub fn release(&mut self) -> bool {
        match self.permit.take() {
            Some(permit) => {
                // Counters first: once the permit is back a waiter may be
                // admitted and count itself in.
                self.stats.on_release();
                drop(permit);
                true
            }
            None => {
                self.stats.duplicate_releases.fetch_add(1, Ordering::SeqCst);
                debug!("duplicate gate release ignored");
                false
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

impl Drop for GateToken {
    fn drop(&mut self) {
        if self.permit.is_some() {
            self.release();
        }
    }
}

impl fmt::Debug for GateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateToken").field("held", &self.is_held()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let gate = ResourceGate::new(2);
        let _a = gate.acquire(soon(100)).await.unwrap();
        let _b = gate.acquire(soon(100)).await.unwrap();
        assert_eq!(gate.available(), 0);

        let err = gate.acquire(soon(20)).await.unwrap_err();
        assert!(matches!(err, GateError::TimedOutWaiting { .. }));
        assert_eq!(gate.snapshot().wait_timeouts, 1);
        assert_eq!(gate.snapshot().in_flight, 2);
    }

    #[tokio::test]
    async fn drop_releases_slot() {
        let gate = ResourceGate::new(1);
        {
            let _t = gate.acquire(soon(100)).await.unwrap();
            assert_eq!(gate.available(), 0);
        }
        assert_eq!(gate.available(), 1);
        let snap = gate.snapshot();
        assert_eq!((snap.acquired, snap.released, snap.in_flight), (1, 1, 0));
    }

    #[tokio::test]
    async fn double_release_is_a_counted_noop() {
        let gate = ResourceGate::new(1);
        let mut t = gate.acquire(soon(100)).await.unwrap();
        assert!(t.release());
        assert!(!t.release());
        drop(t);

        let snap = gate.snapshot();
        assert_eq!(snap.released, 1);
        assert_eq!(snap.duplicate_releases, 1);
        assert_eq!(snap.available, 1);
    }

    #[tokio::test]
    async fn waiter_is_admitted_when_slot_frees() {
        let gate = Arc::new(ResourceGate::new(1));
        let held = gate.acquire(soon(100)).await.unwrap();

        let g = Arc::clone(&gate);
        let waiter = tokio::spawn(async move { g.acquire(soon(1_000)).await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.release(held);

        waiter.await.unwrap().unwrap();
        assert_eq!(gate.snapshot().peak_in_flight, 1);
    }

    #[tokio::test]
    async fn closed_gate_refuses() {
        let gate = ResourceGate::new(1);
        gate.close();
        assert_eq!(gate.acquire(soon(50)).await.unwrap_err(), GateError::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn peak_never_exceeds_capacity_under_churn() {
        let gate = Arc::new(ResourceGate::new(1));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    for _ in 0..2_000 {
                        let token = gate.acquire(soon(10_000)).await.unwrap();
                        drop(token);
                    }
                })
            })
            .collect();
        for w in workers {
            w.await.unwrap();
        }

        let snap = gate.snapshot();
        assert_eq!(snap.peak_in_flight, 1, "{snap:?}");
        assert_eq!(snap.acquired, 16_000);
        assert_eq!(snap.released, 16_000);
        assert_eq!(snap.in_flight, 0);
    }

    #[test]
    fn zero_capacity_rounds_up() {
        assert_eq!(ResourceGate::new(0).capacity(), 1);
    }
}
