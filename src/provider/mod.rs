//! Model backend abstraction
//!
//! What this module provides
//! - The boundary between the dispatch loop and whatever model answers for a
//!   responder. The loop never sees raw model output; it only sees an
//!   [`Outcome`].
//!
//! Exports
//! - Models
//!   - `BackendRequest { responder, targets, conversation }`
//!   - `BackendResponse { outcome, usage }`
//!   - `Outcome::{FinalAnswer, Transfer}` and `TransferDirective { target, note }`
//!   - `BackendError::{Unavailable, Protocol}`
//! - Services
//!   - `ModelBackend: Service<BackendRequest, Response=BackendResponse, Error=BoxError>`
//!   - Implementations: `ChatCompletionsBackend` (async-openai), `ScriptedBackend`
//! - Utils
//!   - `classify(&BoxError) -> BackendError` to recover the error class after
//!     errors have been boxed by layers
//!
//! Implementation strategy
//! - Backends are plain tower services so retry/timeout layers compose around
//!   them without the loop knowing
//! - Transfer targets travel in the request so a backend can advertise them;
//!   validating the backend's choice is still the loop's job
//!
//! Testing strategy
//! - Unit tests for response interpretation without network
//! - Dispatch tests swap in `ScriptedBackend` or `tower::service_fn`

use std::sync::Arc;

use thiserror::Error;
use tower::util::BoxCloneService;
use tower::{BoxError, Service};

use crate::conversation::Conversation;
use crate::error::DispatchError;
use crate::registry::Responder;
use crate::usage::Usage;

mod chat;
mod scripted;

pub use chat::{backend_from_config, transfer_tool_name, ChatCompletionsBackend};
pub use scripted::ScriptedBackend;

/// Everything a backend needs to act as `responder` for one invocation.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub responder: Arc<Responder>,
    /// The responder's transfer-set, resolved from the registry.
    pub targets: Vec<Arc<Responder>>,
    pub conversation: Conversation,
}

/// Transfer requested by a backend. Untrusted until the loop validates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDirective {
    pub target: String,
    pub note: Option<String>,
}

/// What the active responder decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request is fully answered.
    FinalAnswer(String),
    /// Another responder should own the conversation.
    Transfer(TransferDirective),
}

impl Outcome {
    pub fn answer(text: impl Into<String>) -> Self {
        Outcome::FinalAnswer(text.into())
    }

    pub fn transfer(target: impl Into<String>) -> Self {
        Outcome::Transfer(TransferDirective {
            target: target.into(),
            note: None,
        })
    }

    pub fn transfer_with_note(target: impl Into<String>, note: impl Into<String>) -> Self {
        Outcome::Transfer(TransferDirective {
            target: target.into(),
            note: Some(note.into()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub outcome: Outcome,
    pub usage: Usage,
}

impl From<Outcome> for BackendResponse {
    fn from(outcome: Outcome) -> Self {
        Self {
            outcome,
            usage: Usage::unreported(),
        }
    }
}

/// Failure classes a backend may report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Network, auth, rate-limit or timeout trouble. Retryable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Malformed or unparseable response. Not retryable.
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(message) => DispatchError::BackendUnavailable { message },
            BackendError::Protocol(message) => DispatchError::BackendProtocol { message },
        }
    }
}

/// Recover the class of a boxed backend error. Anything that is not a
/// [`BackendError`] counts as the backend being unavailable.
pub fn classify(err: &BoxError) -> BackendError {
    match err.downcast_ref::<BackendError>() {
        Some(e) => e.clone(),
        None => BackendError::Unavailable(err.to_string()),
    }
}

pub trait ModelBackend:
    Service<BackendRequest, Response = BackendResponse, Error = BoxError>
{
}
impl<T> ModelBackend for T where
    T: Service<BackendRequest, Response = BackendResponse, Error = BoxError>
{
}

/// Type-erased backend stack held by the dispatcher.
pub type BackendSvc = BoxCloneService<BackendRequest, BackendResponse, BoxError>;

/// Erase a backend (plus whatever layers wrap it) into a [`BackendSvc`].
pub fn boxed<S>(backend: S) -> BackendSvc
where
    S: ModelBackend + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    BoxCloneService::new(backend)
}
