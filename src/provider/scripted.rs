//! Deterministic backend driven by per-responder scripts.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tower::{BoxError, Service};
use tracing::debug;

use super::{BackendError, BackendRequest, BackendResponse, Outcome};

type Script = Arc<dyn Fn(&BackendRequest) -> Result<Outcome, BackendError> + Send + Sync>;

/// A [`ModelBackend`](super::ModelBackend) that answers from closures keyed
/// by responder name and records every invocation.
///
/// Clones share the invocation log, so a test can keep one handle and give
/// another to the dispatcher.
///
/// ```rust
/// use tower_handoff::provider::ScriptedBackend;
///
/// let backend = ScriptedBackend::new()
///     .transfer("Root", "Specialist")
///     .answer("Specialist", "done");
/// assert_eq!(backend.invocations(), 0);
/// ```
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    scripts: HashMap<String, Script>,
    calls: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.scripts.keys().collect();
        names.sort();
        f.debug_struct("ScriptedBackend")
            .field("scripts", &names)
            .field("latency", &self.latency)
            .finish()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `responder` with an arbitrary closure over the request.
    pub fn respond<F>(mut self, responder: impl Into<String>, f: F) -> Self
    where
        F: Fn(&BackendRequest) -> Result<Outcome, BackendError> + Send + Sync + 'static,
    {
        self.scripts.insert(responder.into(), Arc::new(f));
        self
    }

    /// `responder` always answers with `text`.
    pub fn answer(self, responder: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        self.respond(responder, move |_| Ok(Outcome::answer(text.clone())))
    }

    /// `responder` always transfers to `target`.
    pub fn transfer(self, responder: impl Into<String>, target: impl Into<String>) -> Self {
        let target = target.into();
        self.respond(responder, move |_| Ok(Outcome::transfer(target.clone())))
    }

    /// `responder` always fails with `error`.
    pub fn fail(self, responder: impl Into<String>, error: BackendError) -> Self {
        self.respond(responder, move |_| Err(error.clone()))
    }

    /// Delay every reply, to simulate a slow backend.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of invocations so far, across all clones.
    pub fn invocations(&self) -> usize {
        self.lock_calls().len()
    }

    /// Responder names in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.lock_calls().clone()
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Service<BackendRequest> for ScriptedBackend {
    type Response = BackendResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: BackendRequest) -> Self::Future {
        let name = req.responder.name().to_string();
        self.lock_calls().push(name.clone());
        let script = self.scripts.get(&name).cloned();
        let latency = self.latency;
        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            let script = script.ok_or_else(|| {
                BackendError::Protocol(format!("no script for responder {name:?}"))
            })?;
            let outcome = script(&req)?;
            debug!(responder = %name, outcome = ?outcome, "scripted reply");
            Ok(BackendResponse::from(outcome))
        })
    }
}
