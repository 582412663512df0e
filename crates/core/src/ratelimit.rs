//! Sliding-window admission control.
//!
//! At most N admissions per rolling W-second window per caller. The
//! counter store is the only state shared across concurrent turns from
//! the same caller, so increment-and-check happens as a single
//! operation behind the store lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionStoreError {
    #[error("admission counter store unavailable: {0}")]
    Unavailable(String),
}

/// Snapshot of a caller's window after recording one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSample {
    pub attempts_in_window: u32,
    pub oldest_in_window: Option<DateTime<Utc>>,
}

/// Counter store for admission attempts. Recording and counting are one
/// atomic operation so two concurrent turns cannot both observe the
/// last free slot.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    async fn record_attempt(
        &self,
        caller: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<WindowSample, AdmissionStoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryAdmissionStore {
    windows: Arc<Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>>,
}

#[async_trait]
impl AdmissionStore for InMemoryAdmissionStore {
    async fn record_attempt(
        &self,
        caller: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<WindowSample, AdmissionStoreError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|error| AdmissionStoreError::Unavailable(error.to_string()))?;
        let cutoff = now - window;

        let mut windows = match self.windows.lock() {
            Ok(windows) => windows,
            Err(poisoned) => poisoned.into_inner(),
        };
        let attempts = windows.entry(caller.to_owned()).or_default();

        while attempts.front().is_some_and(|attempt| *attempt <= cutoff) {
            attempts.pop_front();
        }
        attempts.push_back(now);

        Ok(WindowSample {
            attempts_in_window: attempts.len() as u32,
            oldest_in_window: attempts.front().copied(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    /// The counter store was unreachable. Policy is fail-open: the
    /// request proceeds and the caller logs the degradation.
    AllowedDegraded,
    Denied { retry_after: Duration },
}

pub struct SlidingWindowLimiter {
    store: Arc<dyn AdmissionStore>,
    max_admissions: u32,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn AdmissionStore>, max_admissions: u32, window: Duration) -> Self {
        Self { store, max_admissions: max_admissions.max(1), window }
    }

    pub async fn admit(&self, caller: &str) -> Admission {
        self.admit_at(caller, Utc::now()).await
    }

    /// Every attempt increments the caller's window counter, admitted
    /// or not.
    pub async fn admit_at(&self, caller: &str, now: DateTime<Utc>) -> Admission {
        let sample = match self.store.record_attempt(caller, now, self.window).await {
            Ok(sample) => sample,
            Err(_) => return Admission::AllowedDegraded,
        };

        if sample.attempts_in_window <= self.max_admissions {
            return Admission::Allowed {
                remaining: self.max_admissions - sample.attempts_in_window,
            };
        }

        let retry_after = sample
            .oldest_in_window
            .and_then(|oldest| {
                let reopens_at = oldest
                    + chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
                (reopens_at - now).to_std().ok()
            })
            .unwrap_or(self.window);
        Admission::Denied { retry_after }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    use super::{
        Admission, AdmissionStore, AdmissionStoreError, InMemoryAdmissionStore,
        SlidingWindowLimiter, WindowSample,
    };

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + seconds, 0).single().expect("valid timestamp")
    }

    fn limiter() -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            Arc::new(InMemoryAdmissionStore::default()),
            10,
            Duration::from_secs(15),
        )
    }

    #[tokio::test]
    async fn eleventh_attempt_in_window_is_the_only_denial() {
        let limiter = limiter();
        let mut outcomes = Vec::new();
        for attempt in 0..11 {
            outcomes.push(limiter.admit_at("caller-a", at(attempt)).await);
        }

        let denials =
            outcomes.iter().filter(|outcome| matches!(outcome, Admission::Denied { .. })).count();
        assert_eq!(denials, 1);
        assert!(matches!(outcomes[9], Admission::Allowed { remaining: 0 }));
        assert!(matches!(outcomes[10], Admission::Denied { .. }));
    }

    #[tokio::test]
    async fn window_elapses_and_the_caller_is_admitted_again() {
        let limiter = limiter();
        for _ in 0..11 {
            limiter.admit_at("caller-a", at(0)).await;
        }
        assert!(matches!(limiter.admit_at("caller-a", at(1)).await, Admission::Denied { .. }));

        // 16s later the original burst has slid out of the window.
        let outcome = limiter.admit_at("caller-a", at(16)).await;
        assert!(matches!(outcome, Admission::Allowed { .. }));
    }

    #[tokio::test]
    async fn denial_reports_a_bounded_retry_hint() {
        let limiter = limiter();
        for _ in 0..10 {
            limiter.admit_at("caller-a", at(0)).await;
        }
        let outcome = limiter.admit_at("caller-a", at(5)).await;

        let Admission::Denied { retry_after } = outcome else {
            panic!("expected denial, got {outcome:?}");
        };
        assert!(retry_after <= Duration::from_secs(15));
        assert!(retry_after >= Duration::from_secs(9));
    }

    #[tokio::test]
    async fn callers_are_isolated_from_each_other() {
        let limiter = limiter();
        for _ in 0..11 {
            limiter.admit_at("caller-a", at(0)).await;
        }
        assert!(matches!(
            limiter.admit_at("caller-b", at(0)).await,
            Admission::Allowed { remaining: 9 }
        ));
    }

    struct UnavailableStore;

    #[async_trait]
    impl AdmissionStore for UnavailableStore {
        async fn record_attempt(
            &self,
            _caller: &str,
            _now: DateTime<Utc>,
            _window: Duration,
        ) -> Result<WindowSample, AdmissionStoreError> {
            Err(AdmissionStoreError::Unavailable("connection refused".to_owned()))
        }
    }

    #[tokio::test]
    async fn unreachable_store_fails_open() {
        let limiter =
            SlidingWindowLimiter::new(Arc::new(UnavailableStore), 10, Duration::from_secs(15));
        assert_eq!(limiter.admit_at("caller-a", at(0)).await, Admission::AllowedDegraded);
    }
}
