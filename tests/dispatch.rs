//! End-to-end dispatch behavior through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tower::{service_fn, BoxError, ServiceBuilder, ServiceExt};

use tower_handoff::provider::{BackendError, BackendRequest, BackendResponse, ScriptedBackend};
use tower_handoff::registry::presets;
use tower_handoff::resilience::{Backoff, RetryLayer, RetryPolicy, TransientOnly};
use tower_handoff::trace::{MemorySink, RunOutcome, TraceEvent, TraceRecord};
use tower_handoff::{
    CancellationToken, DispatchConfig, DispatchError, Dispatcher, ErrorKind, Outcome, Registry,
    Responder, TurnSource,
};

fn root_specialist() -> Registry {
    Registry::builder()
        .register(Responder::new("Root", "Route requests").with_transfer("Specialist"))
        .unwrap()
        .register(Responder::new("Specialist", "Answer requests"))
        .unwrap()
        .root("Root")
        .build()
        .unwrap()
}

#[tokio::test]
async fn hello_is_answered_by_the_specialist() {
    let backend = ScriptedBackend::new()
        .transfer("Root", "Specialist")
        .answer("Specialist", "done");
    let sink = MemorySink::new();
    let dispatcher = Dispatcher::builder(root_specialist())
        .backend(backend.clone())
        .trace_sink(sink.clone())
        .build()
        .unwrap();

    let result = dispatcher.run("hello").await.unwrap();

    assert_eq!(result.final_answer, "done");
    assert_eq!(result.final_responder, "Specialist");
    assert_eq!(result.invocations, 2);
    assert_eq!(result.hops, 1);
    assert_eq!(backend.calls(), vec!["Root", "Specialist"]);

    let events = sink.events();
    assert_eq!(
        events,
        vec![
            TraceEvent::RunStarted {
                root: "Root".into()
            },
            TraceEvent::ResponderEntered {
                name: "Root".into()
            },
            TraceEvent::TransferTaken {
                from: "Root".into(),
                to: "Specialist".into(),
                note: None,
            },
            TraceEvent::ResponderEntered {
                name: "Specialist".into()
            },
            TraceEvent::RunCompleted {
                outcome: RunOutcome::Answered {
                    responder: "Specialist".into(),
                    hops: 1,
                },
            },
        ]
    );
    assert!(sink.records().iter().all(|r| r.run_id == result.run_id));
}

#[tokio::test]
async fn ping_pong_stops_at_the_hop_limit() {
    let registry = Registry::builder()
        .register(Responder::new("A", "").with_transfer("B"))
        .unwrap()
        .register(Responder::new("B", "").with_transfer("A"))
        .unwrap()
        .root("A")
        .build()
        .unwrap();
    let backend = ScriptedBackend::new().transfer("A", "B").transfer("B", "A");
    let sink = MemorySink::new();
    let dispatcher = Dispatcher::builder(registry)
        .backend(backend.clone())
        .trace_sink(sink.clone())
        .config(DispatchConfig::default().with_max_hops(3))
        .build()
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), dispatcher.run("q"))
        .await
        .expect("run must terminate")
        .unwrap_err();

    assert_eq!(err, DispatchError::HopLimitExceeded { max_hops: 3 });
    assert_eq!(err.kind(), ErrorKind::Protocol);
    let transfers = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, TraceEvent::TransferTaken { .. }))
        .count();
    assert_eq!(transfers, 3);
}

#[tokio::test]
async fn transfer_outside_the_set_is_rejected() {
    let registry = Registry::builder()
        .register(Responder::new("Root", "").with_transfer("Billing"))
        .unwrap()
        .register(Responder::new("Billing", ""))
        .unwrap()
        .register(Responder::new("Legal", ""))
        .unwrap()
        .root("Root")
        .build()
        .unwrap();
    // Legal exists, but Root may not transfer there.
    let backend = ScriptedBackend::new()
        .transfer("Root", "Legal")
        .answer("Legal", "should never run");
    let dispatcher = Dispatcher::builder(registry)
        .backend(backend.clone())
        .build()
        .unwrap();

    let err = dispatcher.run("q").await.unwrap_err();
    assert_eq!(
        err,
        DispatchError::IllegalTransfer {
            from: "Root".into(),
            to: "Legal".into()
        }
    );
    assert_eq!(backend.invocations(), 1);
}

#[tokio::test]
async fn cancellation_during_a_call_records_no_completion() {
    let backend = ScriptedBackend::new()
        .answer("Root", "too late")
        .with_latency(Duration::from_secs(10));
    let sink = MemorySink::new();
    let dispatcher = Dispatcher::builder(root_specialist())
        .backend(backend.clone())
        .trace_sink(sink.clone())
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = dispatcher
        .run_with_cancellation("q", token)
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Cancelled);
    assert_eq!(backend.invocations(), 1);
    assert!(!sink
        .events()
        .iter()
        .any(|e| matches!(e, TraceEvent::RunCompleted { .. })));
}

#[tokio::test]
async fn service_fn_backend_sees_targets_and_conversation() {
    let backend = service_fn(|req: BackendRequest| async move {
        let outcome = match req.responder.name() {
            "Root" => {
                let targets: Vec<_> = req.targets.iter().map(|t| t.name().to_string()).collect();
                assert_eq!(targets, vec!["Specialist".to_string()]);
                Outcome::transfer_with_note("Specialist", "needs an expert")
            }
            _ => {
                let last = req.conversation.last().unwrap();
                assert_eq!(last.source, TurnSource::System);
                Outcome::answer(last.text.clone())
            }
        };
        Ok::<_, BoxError>(BackendResponse::from(outcome))
    });
    let dispatcher = Dispatcher::builder(root_specialist())
        .backend(backend)
        .build()
        .unwrap();

    let result = dispatcher.run("hello").await.unwrap();
    assert_eq!(
        result.final_answer,
        "Root transferred the conversation to Specialist. Note: needs an expert"
    );
}

#[tokio::test]
async fn transient_failures_are_retried_in_the_backend_stack() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let flaky = service_fn(move |_req: BackendRequest| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err::<BackendResponse, BoxError>(Box::new(BackendError::Unavailable(
                    "503".into(),
                )))
            } else {
                Ok(BackendResponse::from(Outcome::answer("recovered")))
            }
        }
    });
    let policy = RetryPolicy {
        max_retries: 2,
        backoff: Backoff::fixed(Duration::from_millis(1)),
    };
    let backend = ServiceBuilder::new()
        .layer(RetryLayer::new(policy, TransientOnly))
        .service(flaky);
    let registry = Registry::builder()
        .register(Responder::new("Root", ""))
        .unwrap()
        .root("Root")
        .build()
        .unwrap();
    let dispatcher = Dispatcher::builder(registry)
        .backend(backend)
        .build()
        .unwrap();

    let result = dispatcher.run("q").await.unwrap();
    assert_eq!(result.final_answer, "recovered");
    // The loop saw a single invocation; the retry stayed inside the stack.
    assert_eq!(result.invocations, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unavailable_backend_is_a_transient_failure() {
    let backend =
        ScriptedBackend::new().fail("Root", BackendError::Unavailable("connection refused".into()));
    let dispatcher = Dispatcher::builder(root_specialist())
        .backend(backend)
        .build()
        .unwrap();

    let err = dispatcher.run("q").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
}

#[tokio::test]
async fn concurrent_runs_share_one_registry() {
    let backend = ScriptedBackend::new()
        .transfer(presets::ORCHESTRATOR, presets::DATA_EXPERT)
        .respond(presets::DATA_EXPERT, |req| {
            Ok(Outcome::answer(format!(
                "data: {}",
                req.conversation.input().unwrap_or_default()
            )))
        });
    let dispatcher = Dispatcher::builder(presets::feasibility_panel().unwrap())
        .backend(backend.clone())
        .build()
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.run(format!("question {i}")).await })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.final_answer, format!("data: question {i}"));
        assert_eq!(result.path, vec![presets::ORCHESTRATOR, presets::DATA_EXPERT]);
    }
    assert_eq!(backend.invocations(), 16);
}

#[tokio::test]
async fn dispatcher_is_a_tower_service() {
    let backend = ScriptedBackend::new()
        .transfer("Root", "Specialist")
        .answer("Specialist", "done");
    let dispatcher = Dispatcher::builder(root_specialist())
        .backend(backend)
        .build()
        .unwrap();

    let result = dispatcher.oneshot("hello".to_string()).await.unwrap();
    assert_eq!(result.final_answer, "done");
    assert_eq!(result.conversation.len(), 3);
}

/// A collector that is never ready.
#[derive(Clone)]
struct UnreadySink;

impl tower::Service<TraceRecord> for UnreadySink {
    type Response = ();
    type Error = BoxError;
    type Future = std::future::Ready<Result<(), BoxError>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Err("collector offline".into()))
    }

    fn call(&mut self, _record: TraceRecord) -> Self::Future {
        std::future::ready(Err("collector offline".into()))
    }
}

#[tokio::test]
async fn failing_sinks_do_not_change_the_answer() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let rejecting = service_fn(move |_record: TraceRecord| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), BoxError>("collector rejected record".into()) }
    });

    let backend = ScriptedBackend::new()
        .transfer("Root", "Specialist")
        .answer("Specialist", "done");
    let dispatcher = Dispatcher::builder(root_specialist())
        .backend(backend.clone())
        .trace_sink(rejecting)
        .build()
        .unwrap();
    let result = dispatcher.run("hello").await.unwrap();
    assert_eq!(result.final_answer, "done");
    assert_eq!(result.hops, 1);
    // Every event was still offered to the sink.
    assert_eq!(attempts.load(Ordering::SeqCst), 5);

    let dispatcher = Dispatcher::builder(root_specialist())
        .backend(backend.clone())
        .trace_sink(UnreadySink)
        .build()
        .unwrap();
    let result = dispatcher.run("hello").await.unwrap();
    assert_eq!(result.final_answer, "done");
    assert_eq!(backend.invocations(), 4);
}

#[tokio::test]
async fn failing_sink_does_not_mask_a_run_failure() {
    let backend = ScriptedBackend::new().transfer("Root", "Nowhere");
    let dispatcher = Dispatcher::builder(root_specialist())
        .backend(backend)
        .trace_sink(UnreadySink)
        .build()
        .unwrap();
    let err = dispatcher.run("hello").await.unwrap_err();
    assert_eq!(
        err,
        DispatchError::IllegalTransfer {
            from: "Root".into(),
            to: "Nowhere".into()
        }
    );
}
