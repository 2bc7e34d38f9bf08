// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0

//! Cancellable deadlines threaded through every remote call

use crate::ReplayError;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Optional point in time plus a cancellation token
///
/// Cloning shares the token, so cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    token: CancellationToken,
}

impl Deadline {
    /// No time limit, cancellable only through [`Deadline::cancel`]
    pub fn none() -> Self {
        Self::default()
    }

    /// Expire `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self { at: Some(Instant::now() + timeout), token: CancellationToken::new() }
    }

    /// Use an externally owned cancellation token
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Token observed by every call made under this deadline
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel every call made under this deadline
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Time left before expiry, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Drive `fut` until it completes, the token fires or the deadline passes
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ReplayError>
    where
        F: Future<Output = Result<T, ReplayError>>,
    {
        if self.token.is_cancelled() {
            return Err(ReplayError::Cancelled);
        }
        let bounded = async {
            match self.at {
                Some(at) => tokio::time::timeout_at(at, fut)
                    .await
                    .map_err(|_| ReplayError::DeadlineExceeded)?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ReplayError::Cancelled),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_completes_before_deadline() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let value = deadline.run(async { Ok::<_, ReplayError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_expires() {
        let deadline = Deadline::after(Duration::from_millis(10));
        let err = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ReplayError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_future() {
        let deadline = Deadline::none();
        let handle = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            handle.cancel();
        });
        let err = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ReplayError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Cancelled));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_polls() {
        let deadline = Deadline::none();
        deadline.cancel();
        let polled = AtomicBool::new(false);
        let err = deadline
            .run(async {
                polled.store(true, Ordering::SeqCst);
                Ok::<_, ReplayError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Cancelled));
        assert!(!polled.load(Ordering::SeqCst));
    }
}
