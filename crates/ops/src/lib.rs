//! Ferry ops: bounded polling and the waiters that track convergence after apply.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::{Event, FerryError, Result};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod status;
mod waiters;

pub use waiters::{GenerationConditionWaiter, GenerationWaiter, PodSelector, PodWaiter};

/// Poll interval and overall deadline for a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self { Self { interval: Duration::from_millis(500), timeout: Duration::from_secs(300) } }
}

impl WaitConfig {
    /// Defaults overridden by `FERRY_WAIT_POLL_MS` / `FERRY_WAIT_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let interval = std::env::var("FERRY_WAIT_POLL_MS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(d.interval);
        let timeout = std::env::var("FERRY_WAIT_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.timeout);
        Self { interval, timeout }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Ready,
    /// Not there yet; carries the observed status for timeout reports.
    Pending(String),
}

/// Run `check` immediately and then every `interval` until it reports ready,
/// the deadline passes, or `cancel` fires. Cancellation and deadline are
/// reported as distinct errors.
pub async fn poll_until<F, Fut>(cfg: &WaitConfig, cancel: &CancellationToken, what: &str, hint: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState>>,
{
    let deadline = Instant::now() + cfg.timeout;
    let mut last = String::from("nothing observed");
    loop {
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FerryError::Cancelled),
            r = check() => r?,
        };
        match state {
            PollState::Ready => return Ok(()),
            PollState::Pending(s) => last = s,
        }
        let now = Instant::now();
        if now >= deadline {
            counter!("wait_timeout", 1u64);
            debug!(what, status = %last, "wait deadline exceeded");
            return Err(FerryError::DeadlineExceeded { what: what.to_string(), status: last, hint: hint.to_string() });
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FerryError::Cancelled),
            _ = tokio::time::sleep(cfg.interval.min(deadline - now)) => {}
        }
    }
}

/// A continuation returned by an apply: blocks until the object converges.
///
/// Events are pushed to `events`; the stream closes when the sender is dropped,
/// which happens when `wait` returns.
#[async_trait]
pub trait Waiter: Send + Sync {
    fn describe(&self) -> String;
    async fn wait(&self, events: mpsc::Sender<Event>, cancel: CancellationToken) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cfg() -> WaitConfig { WaitConfig { interval: Duration::from_millis(500), timeout: Duration::from_secs(2) } }

    #[tokio::test(start_paused = true)]
    async fn returns_once_ready() {
        let n = Arc::new(AtomicUsize::new(0));
        let c = n.clone();
        let r = poll_until(&cfg(), &CancellationToken::new(), "w", "h", || {
            let c = c.clone();
            async move { Ok(if c.fetch_add(1, Ordering::SeqCst) >= 2 { PollState::Ready } else { PollState::Pending("x".into()) }) }
        })
        .await;
        assert!(r.is_ok());
        assert_eq!(n.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_carries_last_status() {
        let err = poll_until(&cfg(), &CancellationToken::new(), "Deployment ns/api", "kubectl -n ns describe deployment api", || async {
            Ok(PollState::Pending("generation 1/2".into()))
        })
        .await
        .unwrap_err();
        match err {
            FerryError::DeadlineExceeded { status, hint, .. } => {
                assert_eq!(status, "generation 1/2");
                assert!(hint.starts_with("kubectl"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_a_timeout() {
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            c2.cancel();
        });
        let err = poll_until(&cfg(), &cancel, "w", "h", || async { Ok(PollState::Pending(String::new())) }).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn check_errors_propagate() {
        let err = poll_until(&cfg(), &CancellationToken::new(), "w", "h", || async { Err(FerryError::internal("bad")) }).await.unwrap_err();
        assert!(matches!(err, FerryError::Internal(_)));
    }

    #[test]
    fn defaults() {
        let d = WaitConfig::default();
        assert_eq!(d.interval, Duration::from_millis(500));
        assert_eq!(d.timeout, Duration::from_secs(300));
    }
}
