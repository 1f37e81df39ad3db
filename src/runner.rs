//! # Dispatcher (orientation)
//!
//! The `Dispatcher` drives one run per request: it asks the model backend to
//! act as the responder that currently owns the conversation, validates any
//! transfer the backend asks for against the registry, and loops until some
//! responder produces a final answer or a safety bound trips.
//!
//! The backend and trace sink are tower services injected at construction;
//! retries and per-call timeouts live in the backend stack, never here.
//!
//! ```rust
//! use tower_handoff::provider::ScriptedBackend;
//! use tower_handoff::registry::{Registry, Responder};
//! use tower_handoff::runner::Dispatcher;
//!
//! # async fn demo() -> tower_handoff::error::Result<()> {
//! let registry = Registry::builder()
//!     .register(Responder::new("Root", "Route requests").with_transfer("Specialist"))?
//!     .register(Responder::new("Specialist", "Answer requests"))?
//!     .root("Root")
//!     .build()?;
//!
//! let backend = ScriptedBackend::new()
//!     .transfer("Root", "Specialist")
//!     .answer("Specialist", "done");
//!
//! let dispatcher = Dispatcher::builder(registry).backend(backend).build()?;
//! let result = dispatcher.run("hello").await?;
//! assert_eq!(result.final_answer, "done");
//! assert_eq!(result.hops, 1);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{DispatchConfig, RevisitPolicy};
use crate::conversation::Conversation;
use crate::error::{DispatchError, Result};
use crate::provider::{
    boxed, classify, BackendRequest, BackendResponse, BackendSvc, ModelBackend, Outcome,
};
use crate::registry::Registry;
use crate::state::RunState;
use crate::trace::{boxed_sink, emit, NoopSink, RunOutcome, TraceEvent, TraceRecord, TraceSink, TraceSinkSvc};
use crate::usage::UsageStats;

fn truncate_for_log(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => {
            let mut out = s[..idx].to_string();
            out.push('…');
            out
        }
        None => s.to_string(),
    }
}

/// The outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub final_answer: String,
    /// Responder that produced the answer
    pub final_responder: String,
    pub conversation: Conversation,
    /// Number of transfers taken
    pub hops: usize,
    /// Number of backend invocations
    pub invocations: usize,
    /// Responders that owned the conversation, in order
    pub path: Vec<String>,
    pub usage: UsageStats,
}

/// Runs requests against a registry of responders.
///
/// Cheap to clone: clones share the registry and clone the backend and sink
/// stacks. Clone once per concurrent task.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    backend: BackendSvc,
    sink: TraceSinkSvc,
    config: DispatchConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("responders", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

pub struct DispatcherBuilder {
    registry: Arc<Registry>,
    backend: Option<BackendSvc>,
    sink: Option<TraceSinkSvc>,
    config: DispatchConfig,
}

impl DispatcherBuilder {
    pub fn backend<S>(mut self, backend: S) -> Self
    where
        S: ModelBackend + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        self.backend = Some(boxed(backend));
        self
    }

    pub fn trace_sink<S>(mut self, sink: S) -> Self
    where
        S: TraceSink + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        self.sink = Some(boxed_sink(sink));
        self
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish construction. Fails if no backend was given or the registry has
    /// no root, so misconfiguration surfaces before any run starts.
    pub fn build(self) -> Result<Dispatcher> {
        let backend = self.backend.ok_or_else(|| DispatchError::MissingConfig {
            key: "backend".to_string(),
        })?;
        self.registry.root()?;
        Ok(Dispatcher {
            registry: self.registry,
            backend,
            sink: self.sink.unwrap_or_else(|| boxed_sink(NoopSink)),
            config: self.config,
        })
    }
}

impl Dispatcher {
    pub fn builder(registry: impl Into<Arc<Registry>>) -> DispatcherBuilder {
        DispatcherBuilder {
            registry: registry.into(),
            backend: None,
            sink: None,
            config: DispatchConfig::default(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run `input` to completion.
    pub fn run(
        &self,
        input: impl Into<String>,
    ) -> impl Future<Output = Result<RunResult>> + Send + 'static {
        self.run_with_cancellation(input, CancellationToken::new())
    }

    /// Run `input` until it completes or `cancel` fires. A cancelled run
    /// returns [`DispatchError::Cancelled`] and records no completion event.
    pub fn run_with_cancellation(
        &self,
        input: impl Into<String>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<RunResult>> + Send + 'static {
        let run = Run {
            run_id: Uuid::new_v4(),
            registry: self.registry.clone(),
            backend: self.backend.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
        };
        let input = input.into();
        async move { run.execute(input, cancel).await }
    }
}

impl Service<String> for Dispatcher {
    type Response = RunResult;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<RunResult>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, input: String) -> Self::Future {
        Box::pin(self.run(input))
    }
}

/// Everything one run owns. Built per call so the run future is `'static`.
struct Run {
    run_id: Uuid,
    registry: Arc<Registry>,
    backend: BackendSvc,
    sink: TraceSinkSvc,
    config: DispatchConfig,
}

async fn invoke(
    backend: &mut BackendSvc,
    request: BackendRequest,
) -> std::result::Result<BackendResponse, BoxError> {
    backend.ready().await?.call(request).await
}

impl Run {
    #[instrument(name = "dispatch", skip_all, fields(run_id = %self.run_id))]
    async fn execute(mut self, input: String, cancel: CancellationToken) -> Result<RunResult> {
        let root = self.registry.root()?.clone();
        debug!(root = %root.name(), input = %truncate_for_log(&input, 120), "run started");
        let mut state = RunState::new(self.run_id, root.clone(), input);
        self.trace(TraceEvent::RunStarted {
            root: root.name().to_string(),
        })
        .await;
        self.trace(TraceEvent::ResponderEntered {
            name: root.name().to_string(),
        })
        .await;

        match self.drive(&mut state, &cancel).await {
            Ok(final_answer) => {
                let final_responder = state.current().name().to_string();
                debug!(
                    responder = %final_responder,
                    hops = state.hops(),
                    invocations = state.invocations(),
                    "run answered"
                );
                self.trace(TraceEvent::RunCompleted {
                    outcome: RunOutcome::Answered {
                        responder: final_responder.clone(),
                        hops: state.hops(),
                    },
                })
                .await;
                Ok(RunResult {
                    run_id: self.run_id,
                    final_answer,
                    final_responder,
                    path: state.path(),
                    hops: state.hops(),
                    invocations: state.invocations(),
                    usage: state.usage().clone(),
                    conversation: state.conversation().clone(),
                })
            }
            Err(err) => {
                state.fail();
                if err.is_cancelled() {
                    info!(responder = %state.current().name(), "run cancelled");
                } else {
                    warn!(
                        responder = %state.current().name(),
                        hops = state.hops(),
                        kind = %err.kind(),
                        error = %err,
                        "run failed"
                    );
                    self.trace(TraceEvent::RunCompleted {
                        outcome: RunOutcome::Failed {
                            kind: err.kind(),
                            message: err.to_string(),
                        },
                    })
                    .await;
                }
                Err(err)
            }
        }
    }

    /// The routing loop. Returns the final answer; every other exit is an
    /// error. Exactly one turn is appended per iteration.
    async fn drive(&mut self, state: &mut RunState, cancel: &CancellationToken) -> Result<String> {
        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            if let Some(deadline) = self.config.run_deadline {
                if state.elapsed() >= deadline {
                    return Err(DispatchError::DeadlineExceeded {
                        deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }

            let responder = state.current().clone();
            let request = BackendRequest {
                responder: responder.clone(),
                targets: self.registry.targets_of(responder.name())?,
                conversation: state.conversation().clone(),
            };
            debug!(
                responder = %responder.name(),
                invocation = state.invocations() + 1,
                turns = request.conversation.len(),
                "invoking backend"
            );

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                res = invoke(&mut self.backend, request) => res,
            };
            let response = response.map_err(|e| DispatchError::from(classify(&e)))?;
            state.record_invocation(response.usage);

            match response.outcome {
                Outcome::FinalAnswer(text) => {
                    debug!(
                        responder = %responder.name(),
                        answer = %truncate_for_log(&text, 160),
                        "final answer"
                    );
                    state.answer(&text);
                    return Ok(text);
                }
                Outcome::Transfer(directive) => {
                    let from = responder.name();
                    if !responder.can_transfer_to(&directive.target) {
                        return Err(DispatchError::IllegalTransfer {
                            from: from.to_string(),
                            to: directive.target,
                        });
                    }
                    if self.config.revisit == RevisitPolicy::Forbid
                        && state.has_visited(&directive.target)
                    {
                        let mut path = state.path();
                        path.push(directive.target.clone());
                        return Err(DispatchError::CycleDetected {
                            target: directive.target,
                            path,
                        });
                    }

                    let target = self.registry.get(&directive.target)?.clone();
                    state.transfer_to(target, directive.note.as_deref());
                    if state.hops() > self.config.max_hops {
                        return Err(DispatchError::HopLimitExceeded {
                            max_hops: self.config.max_hops,
                        });
                    }

                    debug!(
                        from = %from,
                        to = %directive.target,
                        hops = state.hops(),
                        "transfer taken"
                    );
                    self.trace(TraceEvent::TransferTaken {
                        from: from.to_string(),
                        to: directive.target.clone(),
                        note: directive.note,
                    })
                    .await;
                    self.trace(TraceEvent::ResponderEntered {
                        name: directive.target,
                    })
                    .await;
                }
            }
        }
    }

    async fn trace(&mut self, event: TraceEvent) {
        emit(&mut self.sink, TraceRecord::new(self.run_id, event)).await;
    }
}
