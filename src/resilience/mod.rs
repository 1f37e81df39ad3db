//! Resilience layers for model backends: retry and per-call timeout
//!
//! What this module provides
//! - Tower middleware that lives on the adapter side of the boundary. The
//!   dispatch loop never retries; a backend stack wrapped in these layers
//!   retries transient failures before the loop ever sees them.
//!
//! Exports
//! - Models
//!   - `RetryPolicy { max_retries, backoff: Backoff }`
//!   - `Backoff` (fixed, exponential with cap)
//! - Layers
//!   - `RetryLayer<Classifier>`
//!   - `TimeoutLayer(Duration)`
//! - Utils
//!   - `ErrorClassifier` and the default `TransientOnly` classifier
//!
//! Composition
//! - `ServiceBuilder::new().layer(RetryLayer::new(policy, TransientOnly)).layer(TimeoutLayer::new(dur)).service(backend)`
//!   retries each attempt under its own timeout
//!
//! Testing strategy
//! - Fake services that fail in a scripted pattern; assert attempt counts and
//!   that protocol errors are not retried

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::warn;

use crate::config::RetryConfig;
use crate::provider::{classify, BackendError};

// ===== Retry =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub initial: Duration,
    pub factor: f32,
    pub max: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial: delay,
            factor: 1.0,
            max: delay,
        }
    }

    pub fn exponential(initial: Duration, factor: f32, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial,
            factor,
            max,
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                // Work in nanoseconds as f64: exact for power-of-two factors,
                // and an overflowing product saturates to infinity.
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let nanos = self.initial.as_nanos() as f64 * f64::from(self.factor).powi(exponent);
                if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
                    self.max
                } else {
                    Duration::from_nanos(nanos.max(0.0).round() as u64)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Backoff,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff: Backoff::exponential(cfg.initial_delay, cfg.backoff_multiplier, cfg.max_delay),
        }
    }
}

pub trait ErrorClassifier: Send + Sync + 'static {
    fn retryable(&self, error: &BoxError) -> bool;
}

/// Retry only errors that classify as [`BackendError::Unavailable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientOnly;

impl ErrorClassifier for TransientOnly {
    fn retryable(&self, error: &BoxError) -> bool {
        classify(error).is_retryable()
    }
}

#[derive(Debug, Clone)]
pub struct RetryLayer<C> {
    policy: RetryPolicy,
    classifier: C,
}

impl<C> RetryLayer<C> {
    pub fn new(policy: RetryPolicy, classifier: C) -> Self {
        Self { policy, classifier }
    }
}

/// Retrying service. Each call works on its own clone of the inner service,
/// so concurrent runs sharing one stack never wait on each other.
#[derive(Debug, Clone)]
pub struct Retry<S, C> {
    inner: S,
    policy: RetryPolicy,
    classifier: C,
}

impl<S, C> Layer<S> for RetryLayer<C>
where
    C: Clone,
{
    type Service = Retry<S, C>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            policy: self.policy,
            classifier: self.classifier.clone(),
        }
    }
}

impl<S, C, Req> Service<Req> for Retry<S, C>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    C: ErrorClassifier + Clone,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let policy = self.policy;
        let classifier = self.classifier.clone();
        let mut inner = self.inner.clone();
        let mut attempts: usize = 0;
        Box::pin(async move {
            loop {
                let result = ServiceExt::ready(&mut inner)
                    .await?
                    .call(req.clone())
                    .await;
                match result {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if attempts >= policy.max_retries || !classifier.retryable(&e) {
                            return Err(e);
                        }
                        let delay = policy.backoff.delay_for_attempt(attempts);
                        attempts += 1;
                        warn!(
                            attempt = attempts,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "retrying backend call"
                        );
                        sleep(delay).await;
                    }
                }
            }
        })
    }
}

// ===== Timeout =====

#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    dur: Duration,
}

impl TimeoutLayer {
    pub fn new(dur: Duration) -> Self {
        Self { dur }
    }
}

/// Bounds a single call; an elapsed deadline is reported as the backend being
/// unavailable.
#[derive(Debug, Clone)]
pub struct Timeout<S> {
    inner: S,
    dur: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            dur: self.dur,
        }
    }
}

impl<S, Req> Service<Req> for Timeout<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        let dur = self.dur;
        Box::pin(async move {
            match timeout(dur, fut).await {
                Ok(r) => r,
                Err(_) => Err(Box::new(BackendError::Unavailable(format!(
                    "backend call timed out after {}ms",
                    dur.as_millis()
                ))) as BoxError),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tower::service_fn;

    fn quick(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Backoff::fixed(Duration::from_millis(1)),
        }
    }

    #[tokio::test]
    async fn retry_eventually_succeeds() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let svc = service_fn(move |()| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err::<(), BoxError>(Box::new(BackendError::Unavailable("503".into())))
                } else {
                    Ok::<(), BoxError>(())
                }
            }
        });
        let mut svc = RetryLayer::new(quick(5), TransientOnly).layer(svc);
        ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let svc = service_fn(move |()| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>(Box::new(BackendError::Unavailable("down".into())))
            }
        });
        let mut svc = RetryLayer::new(quick(2), TransientOnly).layer(svc);
        let err = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap_err();
        assert_eq!(classify(&err), BackendError::Unavailable("down".into()));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn protocol_errors_are_not_retried() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let svc = service_fn(move |()| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>(Box::new(BackendError::Protocol("garbage".into())))
            }
        });
        let mut svc = RetryLayer::new(quick(5), TransientOnly).layer(svc);
        let _ = ServiceExt::ready(&mut svc).await.unwrap().call(()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_reports_unavailable() {
        let svc = service_fn(|()| async move {
            sleep(Duration::from_millis(50)).await;
            Ok::<(), BoxError>(())
        });
        let mut svc = TimeoutLayer::new(Duration::from_millis(5)).layer(svc);
        let err = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap_err();
        let class = classify(&err);
        assert!(class.is_retryable());
        assert!(class.to_string().contains("timed out"));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let b = Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_millis(300));
        assert_eq!(b.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(300));
        assert_eq!(b.delay_for_attempt(5), Duration::from_millis(300));
    }

    #[test]
    fn huge_attempt_numbers_stay_at_the_cap() {
        let b = Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(5));
        assert_eq!(b.delay_for_attempt(usize::MAX / 2), Duration::from_secs(5));
        assert_eq!(b.delay_for_attempt(usize::MAX), Duration::from_secs(5));

        let policy = RetryPolicy::from(&RetryConfig {
            max_retries: 100,
            ..RetryConfig::default()
        });
        assert_eq!(policy.backoff.delay_for_attempt(70), Duration::from_secs(5));
    }

    #[test]
    fn default_retry_config_doubles_from_the_initial_delay() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.backoff.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.backoff.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.backoff.delay_for_attempt(2), Duration::from_millis(800));
    }
}
