//! Process-wide admission control for outbound requests.
//!
//! Tokio's semaphore hands out permits in FIFO order, so waiters are admitted
//! in the order they queued. The governor is independent of per-attempt
//! timeouts: time spent waiting for a permit does not count against one.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// FIFO queue capping the number of simultaneous outbound requests.
#[derive(Debug, Clone)]
pub struct ConcurrencyGovernor {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    peak: Arc<AtomicUsize>,
}

/// Held for the duration of one admitted request.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGovernor {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a slot.
    pub async fn admit(&self) -> Admission {
        // The semaphore is never closed, so acquisition cannot fail.
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("governor semaphore closed"),
        };
        let in_flight = self.in_flight();
        self.peak.fetch_max(in_flight, Ordering::Relaxed);
        Admission { _permit: permit }
    }

    /// Run `op` while holding a slot.
    pub async fn run<F, T>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let _admission = self.admit().await;
        op.await
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Highest number of simultaneously admitted requests observed so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}
