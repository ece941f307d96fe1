//! Fleet-wide cap on concurrent reboots.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::FleetError;

/// Counting gate backed by a fair semaphore. Waiters are woken in FIFO order.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    slots: Arc<Semaphore>,
    max: usize,
}

/// A held slot. Dropping it releases the slot as well.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl LimiterPermit {
    pub fn release(self) {}
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Wait for a slot, or give up when `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<LimiterPermit, FleetError> {
        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FleetError::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                let permit = permit.map_err(|_| FleetError::Cancelled)?;
                Ok(LimiterPermit { _permit: permit })
            }
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.max - self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_is_coerced_to_one() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.max(), 1);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn third_acquire_waits_for_release() {
        let limiter = ConcurrencyLimiter::new(2);
        let cancel = CancellationToken::new();

        let first = limiter.acquire(&cancel).await.unwrap();
        let _second = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.active(), 2);

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.release();
        let third = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn cancellation_releases_waiter() {
        let limiter = ConcurrencyLimiter::new(1);
        let cancel = CancellationToken::new();
        let _held = limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(FleetError::Cancelled)));
        assert_eq!(limiter.active(), 1);
    }

    #[tokio::test]
    async fn never_exceeds_max_holders() {
        let limiter = ConcurrencyLimiter::new(3);
        let cancel = CancellationToken::new();
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                let permit = limiter.acquire(&cancel).await.unwrap();
                peak.fetch_max(limiter.active(), std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                permit.release();
            });
        }
        while tasks.join_next().await.is_some() {}

        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
        assert_eq!(limiter.active(), 0);
    }
}
