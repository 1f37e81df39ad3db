//! Route one question through a panel of responders and print the answer.
//!
//! Exit status: 0 answered, 1 configuration or startup error, 2 run failure,
//! 130 cancelled (Ctrl-C).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tower_handoff::config::{AppConfig, DispatchConfig, RevisitPolicy};
use tower_handoff::provider::{backend_from_config, BackendRequest, ScriptedBackend};
use tower_handoff::registry::{presets, Registry};
use tower_handoff::trace::{sink_with_flush_from_config, FlushHandle, LogSink};
use tower_handoff::{CancellationToken, DispatchError, Dispatcher, ErrorKind, Outcome, TurnSource};

const ENV_FILE: &str = ".env";
const TRACE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_QUESTION: &str = "I'd like to add a button that, when pressed, displays all currently active users and their monthly averages for time and money spent on the app.";

#[derive(Parser, Debug)]
#[command(name = "handoff-dispatch", about = "Route a question to the right specialist")]
struct Args {
    /// Question to route
    #[arg(default_value = DEFAULT_QUESTION)]
    question: String,

    /// TOML registry file; defaults to the built-in feasibility panel
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Maximum number of transfers per run
    #[arg(long)]
    max_hops: Option<usize>,

    /// Fail instead of transferring back to a responder already visited
    #[arg(long)]
    no_revisit: bool,

    /// Use a scripted backend instead of calling a model
    #[arg(long)]
    dry_run: bool,

    /// Print the full run result as JSON
    #[arg(long)]
    json: bool,
}

const EXIT_CONFIG: u8 = 1;
const EXIT_RUN_FAILED: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

fn exit_status(err: &DispatchError) -> u8 {
    match err.kind() {
        ErrorKind::Configuration => EXIT_CONFIG,
        ErrorKind::Cancelled => EXIT_CANCELLED,
        ErrorKind::Protocol | ErrorKind::Transient => EXIT_RUN_FAILED,
    }
}

/// Offline stand-in: the first responder hands off to its first target, and
/// whoever receives the conversation answers with a canned reply.
fn dry_run_backend(registry: &Registry) -> ScriptedBackend {
    registry.iter().fold(ScriptedBackend::new(), |backend, responder| {
        let first_target = responder.transfers().first().cloned();
        let name = responder.name().to_string();
        backend.respond(responder.name(), move |req: &BackendRequest| {
            let transferred = req
                .conversation
                .turns()
                .iter()
                .any(|t| t.source == TurnSource::System);
            match (&first_target, transferred) {
                (Some(target), false) => Ok(Outcome::transfer_with_note(
                    target.clone(),
                    "dry run: first listed specialist",
                )),
                _ => Ok(Outcome::answer(format!(
                    "[dry run] {name} would answer: {}",
                    req.conversation.input().unwrap_or_default()
                ))),
            }
        })
    })
}

/// Build the dispatcher; `load_config` is only consulted for live runs.
fn build_dispatcher<L>(
    args: &Args,
    load_config: L,
) -> Result<(Dispatcher, FlushHandle), DispatchError>
where
    L: FnOnce() -> Result<AppConfig, DispatchError>,
{
    let registry = match &args.registry {
        Some(path) => Registry::from_path(path)?,
        None => presets::feasibility_panel()?,
    };

    let (builder, mut dispatch, flush) = if args.dry_run {
        let backend = dry_run_backend(&registry);
        let builder = Dispatcher::builder(registry)
            .backend(backend)
            .trace_sink(LogSink);
        (builder, DispatchConfig::default(), FlushHandle::new())
    } else {
        let config = load_config()?;
        let (sink, flush) = sink_with_flush_from_config(&config.trace);
        let builder = Dispatcher::builder(registry)
            .backend(backend_from_config(&config.backend)?)
            .trace_sink(sink);
        (builder, config.dispatch, flush)
    };

    if let Some(max_hops) = args.max_hops {
        dispatch = dispatch.with_max_hops(max_hops);
    }
    if args.no_revisit {
        dispatch = dispatch.with_revisit_policy(RevisitPolicy::Forbid);
    }
    Ok((builder.config(dispatch).build()?, flush))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let built = build_dispatcher(&args, || AppConfig::from_env_file(ENV_FILE));
    let (dispatcher, flush) = match built {
        Ok(built) => built,
        Err(e) => {
            error!(error = %e, "configuration error");
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let outcome = dispatcher
        .run_with_cancellation(args.question.clone(), cancel)
        .await;
    if !flush.flush(TRACE_FLUSH_TIMEOUT).await {
        warn!("some trace records were not delivered before exit");
    }

    match outcome {
        Ok(result) => {
            if args.json {
                match serde_json::to_string_pretty(&result) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("failed to encode result: {e}");
                        return ExitCode::from(EXIT_RUN_FAILED);
                    }
                }
            } else {
                println!("{}", result.final_answer);
            }
            info!(usage = %result.usage.summary(), "usage");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(exit_status(&e))
        }
    }
}
