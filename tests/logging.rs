//! What the dispatcher and backends write to the `tracing` pipeline.

use std::io;
use std::sync::{Arc, Mutex};

use tower::ServiceExt;
use tracing::subscriber::DefaultGuard;
use tracing::Level;

use tower_handoff::conversation::Conversation;
use tower_handoff::provider::{BackendRequest, ChatCompletionsBackend, ScriptedBackend};
use tower_handoff::trace::LogSink;
use tower_handoff::{Dispatcher, Registry, Responder};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn install(self, level: Level) -> DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn count(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

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
async fn log_sink_events_are_printed_once_at_info() {
    let captured = Captured::default();
    let _guard = captured.clone().install(Level::INFO);

    let dispatcher = Dispatcher::builder(root_specialist())
        .backend(
            ScriptedBackend::new()
                .transfer("Root", "Specialist")
                .answer("Specialist", "done"),
        )
        .trace_sink(LogSink)
        .build()
        .unwrap();
    let result = dispatcher.run("hello").await.unwrap();
    assert_eq!(result.final_answer, "done");

    assert_eq!(captured.count("run started"), 1);
    assert_eq!(captured.count("transfer taken"), 1);
    assert_eq!(captured.count("run answered"), 1);
}

#[tokio::test]
async fn chat_backend_logs_inside_its_span() {
    let captured = Captured::default();
    let _guard = captured.clone().install(Level::DEBUG);

    // Nothing listens on the discard port, so the call fails fast after
    // logging the outgoing request.
    let backend =
        ChatCompletionsBackend::openai("sk-test", Some("http://127.0.0.1:9/v1"), "gpt-4o").unwrap();
    let request = BackendRequest {
        responder: Arc::new(Responder::new("Root", "Route requests")),
        targets: vec![],
        conversation: Conversation::new("hello"),
    };
    let outcome = backend.oneshot(request).await;
    assert!(outcome.is_err());

    let sending: Vec<_> = captured
        .lines()
        .into_iter()
        .filter(|l| l.contains("sending chat completion"))
        .collect();
    assert_eq!(sending.len(), 1, "{sending:?}");
    assert!(sending[0].contains("chat_completion{"), "{}", sending[0]);
    assert!(sending[0].contains("responder=Root"), "{}", sending[0]);
    assert!(sending[0].contains("model=gpt-4o"), "{}", sending[0]);
}
