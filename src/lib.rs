//! # Tower Handoff
//!
//! A Tower-based dispatch runtime that routes one request among a small set of
//! specialist responders. A router responder decides who owns the
//! conversation, control transfers to that responder, and its answer goes
//! back to the caller.
//!
//! ## Core Concepts
//!
//! - **Responder**: a named role with instructions and the set of responders it
//!   may transfer to. Collected in an immutable, eagerly validated [`Registry`].
//! - **Model backend**: a Tower service that, given a responder and the
//!   conversation so far, returns either a final answer or a transfer.
//! - **Dispatcher**: the loop that invokes the backend, validates transfers
//!   and enforces the hop limit, the optional no-revisit policy and the
//!   optional run deadline.
//! - **Trace sink**: a best-effort Tower service that receives run events.
//!
//! ## Getting Started
//!
//! Set `OPENAI_API_KEY` (or the `AZURE_OPENAI_*` variables) and build the
//! dispatcher from configuration.
//!
//! ```rust,no_run
//! use tower_handoff::config::AppConfig;
//! use tower_handoff::provider::backend_from_config;
//! use tower_handoff::registry::presets;
//! use tower_handoff::trace::sink_from_config;
//! use tower_handoff::Dispatcher;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = AppConfig::from_env()?;
//!
//! let dispatcher = Dispatcher::builder(presets::feasibility_panel()?)
//!     .backend(backend_from_config(&config.backend)?)
//!     .trace_sink(sink_from_config(&config.trace))
//!     .config(config.dispatch)
//!     .build()?;
//!
//! let result = dispatcher
//!     .run("Can we add a CSV export to the reporting page?")
//!     .await?;
//! println!("{}: {}", result.final_responder, result.final_answer);
//! # Ok(())
//! # }
//! ```
//!
//! Tests and offline demos swap in [`provider::ScriptedBackend`].

pub mod config;
pub mod conversation;
pub mod error;
pub mod provider;
pub mod registry;
pub mod resilience;
pub mod runner;
pub mod state;
pub mod trace;
pub mod usage;

// Public re-exports for convenience
pub use config::{AppConfig, DispatchConfig, RevisitPolicy};
pub use conversation::{Conversation, Turn, TurnSource};
pub use error::{DispatchError, ErrorKind, Result};
pub use provider::{BackendError, Outcome, ScriptedBackend, TransferDirective};
pub use registry::{Registry, Responder};
pub use runner::{Dispatcher, RunResult};
pub use state::DispatchState;

// Cancellation handle accepted by `Dispatcher::run_with_cancellation`
pub use tokio_util::sync::CancellationToken;

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
