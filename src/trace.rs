//! Run trace events and the sinks that receive them
//!
//! What this module provides
//! - A small, write-only event model describing what a run did, and sinks
//!   that record it somewhere. Sinks are best-effort: the dispatch loop
//!   drops sink errors after logging them at debug level, and never reads
//!   anything back.
//!
//! Exports
//! - Models
//!   - `TraceRecord { run_id, at, event }`
//!   - `TraceEvent::{RunStarted, ResponderEntered, TransferTaken, RunCompleted}`
//!   - `RunOutcome::{Answered, Failed}`
//! - Services
//!   - `TraceSink: Service<TraceRecord, Response=(), Error=BoxError>`
//!   - Implementations: `NoopSink`, `LogSink`, `MemorySink`, `HttpExportSink`
//! - Utils
//!   - `sink_from_config(&TraceConfig) -> TraceSinkSvc`
//!   - `FlushHandle` waits for HTTP deliveries still in flight
//!
//! Cancelled runs record no `RunCompleted`; every other run records exactly
//! one.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TraceConfig;
use crate::error::ErrorKind;

/// How a run ended, for runs that were not cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Answered { responder: String, hops: usize },
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    RunStarted {
        root: String,
    },
    ResponderEntered {
        name: String,
    },
    TransferTaken {
        from: String,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    RunCompleted {
        outcome: RunOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TraceEvent,
}

impl TraceRecord {
    pub fn new(run_id: Uuid, event: TraceEvent) -> Self {
        Self {
            run_id,
            at: Utc::now(),
            event,
        }
    }
}

pub trait TraceSink: Service<TraceRecord, Response = (), Error = BoxError> {}
impl<T> TraceSink for T where T: Service<TraceRecord, Response = (), Error = BoxError> {}

pub type TraceSinkSvc = BoxCloneService<TraceRecord, (), BoxError>;

pub fn boxed_sink<S>(sink: S) -> TraceSinkSvc
where
    S: TraceSink + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    BoxCloneService::new(sink)
}

/// Deliver one record, swallowing any sink failure.
pub(crate) async fn emit(sink: &mut TraceSinkSvc, record: TraceRecord) {
    let result = match sink.ready().await {
        Ok(svc) => svc.call(record).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        debug!(error = %e, "trace sink failed; record dropped");
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl Service<TraceRecord> for NoopSink {
    type Response = ();
    type Error = BoxError;
    type Future = SinkFuture;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _record: TraceRecord) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

/// Turns records into structured `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl Service<TraceRecord> for LogSink {
    type Response = ();
    type Error = BoxError;
    type Future = SinkFuture;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: TraceRecord) -> Self::Future {
        let run_id = record.run_id;
        match &record.event {
            TraceEvent::RunStarted { root } => {
                info!(%run_id, root = %root, "run started")
            }
            TraceEvent::ResponderEntered { name } => {
                info!(%run_id, responder = %name, "responder entered")
            }
            TraceEvent::TransferTaken { from, to, note } => {
                info!(%run_id, from = %from, to = %to, note = ?note, "transfer taken")
            }
            TraceEvent::RunCompleted {
                outcome: RunOutcome::Answered { responder, hops },
            } => info!(%run_id, responder = %responder, hops, "run answered"),
            TraceEvent::RunCompleted {
                outcome: RunOutcome::Failed { kind, message },
            } => info!(%run_id, kind = %kind, message = %message, "run failed"),
        }
        Box::pin(async { Ok(()) })
    }
}

/// Keeps records in memory; clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TraceRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }
}

impl Service<TraceRecord> for MemorySink {
    type Response = ();
    type Error = BoxError;
    type Future = SinkFuture;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: TraceRecord) -> Self::Future {
        let stored = match self.records.lock() {
            Ok(mut records) => {
                records.push(record);
                Ok(())
            }
            Err(_) => Err("memory sink poisoned".into()),
        };
        Box::pin(async move { stored })
    }
}

/// Background deliveries started by an [`HttpExportSink`]. Clones share
/// the same set, so a caller can hold one and await it before shutdown.
#[derive(Clone, Default)]
pub struct FlushHandle {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl std::fmt::Debug for FlushHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushHandle")
            .field("pending", &self.pending())
            .finish()
    }
}

impl FlushHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn<F>(&self, delivery: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(delivery);
    }

    /// Deliveries spawned and not yet reaped.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait up to `within` for every delivery started so far. Returns `false`
    /// if some were still running; those are aborted.
    pub async fn flush(&self, within: Duration) -> bool {
        let mut tasks = std::mem::take(&mut *self.lock());
        let drained = tokio::time::timeout(within, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            debug!(aborted = tasks.len(), "trace flush timed out");
        }
        drained
    }
}

/// POSTs each record as JSON to an ingest endpoint with a bearer key.
///
/// Delivery happens on a background task so a slow collector never holds up
/// a run; failures there are only logged. Await [`HttpExportSink::flush_handle`]
/// before the runtime shuts down to avoid losing the last records.
#[derive(Debug, Clone)]
pub struct HttpExportSink {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    pending: FlushHandle,
}

impl HttpExportSink {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            pending: FlushHandle::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn flush_handle(&self) -> FlushHandle {
        self.pending.clone()
    }
}

impl Service<TraceRecord> for HttpExportSink {
    type Response = ();
    type Error = BoxError;
    type Future = SinkFuture;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: TraceRecord) -> Self::Future {
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&record);
        let pending = self.pending.clone();
        Box::pin(async move {
            pending.spawn(async move {
                match request.send().await.and_then(|r| r.error_for_status()) {
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "trace export failed"),
                }
            });
            Ok(())
        })
    }
}

/// Pick a sink for the given settings: nothing when disabled, HTTP export
/// when an endpoint is configured, structured logs otherwise.
pub fn sink_from_config(config: &TraceConfig) -> TraceSinkSvc {
    sink_with_flush_from_config(config).0
}

/// Like [`sink_from_config`], also returning the handle that awaits HTTP
/// deliveries. For sinks that deliver inline the handle is always empty.
pub fn sink_with_flush_from_config(config: &TraceConfig) -> (TraceSinkSvc, FlushHandle) {
    if !config.enabled {
        return (boxed_sink(NoopSink), FlushHandle::new());
    }
    match (&config.endpoint, &config.api_key) {
        (Some(endpoint), Some(api_key)) => {
            let sink = HttpExportSink::new(endpoint, api_key);
            let flush = sink.flush_handle();
            (boxed_sink(sink), flush)
        }
        _ => (boxed_sink(LogSink), FlushHandle::new()),
    }
}
