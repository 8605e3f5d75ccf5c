//! Deadline propagation.
//!
//! # Responsibilities
//! - Carry one caller deadline through every suspension point of a guarded call
//! - Bound individual attempts with their own timeout
//! - Fail fast when a wait cannot finish before the deadline
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities, so paused-clock tests drive it deterministically
//! - A wait that would overrun the deadline returns immediately instead of sleeping first
//! - Dropping the waiting future detaches the caller without touching shared state

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::resilience::classify::CallError;

/// The deadline elapsed while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

/// Absolute point in time by which a guarded call must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self { at: None }
    }

    /// A budget too large to represent is unbounded.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(budget),
        }
    }

    /// Zero means no deadline.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::none()
        } else {
            Self::after(Duration::from_millis(ms))
        }
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Run `fut` until it completes or the deadline passes.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        match self.at {
            None => Ok(fut.await),
            Some(at) => tokio::time::timeout_at(at, fut).await.map_err(|_| Elapsed),
        }
    }

    /// Sleep for `delay`, failing immediately if that would overrun the deadline.
    pub async fn sleep(&self, delay: Duration) -> Result<(), Elapsed> {
        if let Some(remaining) = self.remaining() {
            if delay >= remaining {
                return Err(Elapsed);
            }
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

/// Bound one attempt by `timeout`, reporting expiry as a downstream timeout.
pub async fn with_attempt_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, CallError>
where
    F: Future<Output = Result<T, CallError>>,
{
    match timeout {
        None => fut.await,
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .unwrap_or(Err(CallError::Timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_fails_fast_past_deadline() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let start = Instant::now();
        assert_eq!(deadline.sleep(Duration::from_millis(500)).await, Err(Elapsed));
        assert_eq!(start.elapsed(), Duration::ZERO);

        assert_eq!(deadline.sleep(Duration::from_millis(50)).await, Ok(()));
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Duration::from_millis(10));
        let result = deadline
            .run(tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert_eq!(result, Err(Elapsed));
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_maps_to_call_timeout() {
        let result: Result<(), CallError> = with_attempt_timeout(
            Some(Duration::from_millis(5)),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            },
        )
        .await;
        assert_eq!(result, Err(CallError::Timeout));
    }

    #[test]
    fn test_unbounded_deadline() {
        let d = Deadline::from_millis(0);
        assert_eq!(d.remaining(), None);
        assert!(!d.is_expired());
        assert_eq!(Deadline::after(Duration::MAX), Deadline::none());
    }
}
