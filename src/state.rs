//! Per-run state owned by the dispatch loop.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conversation::{Conversation, Turn};
use crate::registry::Responder;
use crate::usage::{Usage, UsageStats};

/// Lifecycle of a run. `Routing` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Routing,
    Answered,
    Failed,
}

impl DispatchState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DispatchState::Routing)
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchState::Routing => write!(f, "routing"),
            DispatchState::Answered => write!(f, "answered"),
            DispatchState::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable bookkeeping for one run. Created at run start and dropped when the
/// run ends; nothing outside the loop mutates it.
#[derive(Debug)]
pub struct RunState {
    run_id: Uuid,
    current: Arc<Responder>,
    conversation: Conversation,
    hops: usize,
    /// Responders the run has left, oldest first.
    visited: Vec<String>,
    invocations: usize,
    usage: UsageStats,
    state: DispatchState,
    started: Instant,
}

impl RunState {
    pub fn new(run_id: Uuid, root: Arc<Responder>, input: impl Into<String>) -> Self {
        Self {
            run_id,
            current: root,
            conversation: Conversation::new(input),
            hops: 0,
            visited: Vec::new(),
            invocations: 0,
            usage: UsageStats::new(),
            state: DispatchState::Routing,
            started: Instant::now(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn current(&self) -> &Arc<Responder> {
        &self.current
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn hops(&self) -> usize {
        self.hops
    }

    pub fn visited(&self) -> &[String] {
        &self.visited
    }

    pub fn invocations(&self) -> usize {
        self.invocations
    }

    pub fn usage(&self) -> &UsageStats {
        &self.usage
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Every responder the run has been owned by, in order, ending with the
    /// current one.
    pub fn path(&self) -> Vec<String> {
        let mut path = self.visited.clone();
        path.push(self.current.name().to_string());
        path
    }

    /// True if `name` is the current responder or one the run already left.
    pub fn has_visited(&self, name: &str) -> bool {
        self.current.name() == name || self.visited.iter().any(|v| v == name)
    }

    pub(crate) fn record_invocation(&mut self, usage: Usage) {
        self.invocations += 1;
        self.usage.record(self.current.name(), usage);
    }

    /// Record the current responder's answer and finish the run.
    pub(crate) fn answer(&mut self, text: &str) {
        self.conversation
            .push(Turn::responder(self.current.name(), text));
        self.transition(DispatchState::Answered);
    }

    /// Hand the conversation to `target`. The caller has already checked the
    /// transfer is legal.
    pub(crate) fn transfer_to(&mut self, target: Arc<Responder>, note: Option<&str>) {
        self.conversation
            .push(Turn::transfer(self.current.name(), target.name(), note));
        let previous = std::mem::replace(&mut self.current, target);
        self.visited.push(previous.name().to_string());
        self.hops += 1;
    }

    pub(crate) fn fail(&mut self) {
        self.transition(DispatchState::Failed);
    }

    fn transition(&mut self, next: DispatchState) {
        if self.state.is_terminal() {
            warn!(
                run_id = %self.run_id,
                from = %self.state,
                to = %next,
                "ignoring transition out of terminal state"
            );
            return;
        }
        debug!(
            run_id = %self.run_id,
            from = %self.state,
            to = %next,
            responder = %self.current.name(),
            hops = self.hops,
            "dispatch state transition"
        );
        self.state = next;
    }
}
