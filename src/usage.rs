//! # Token usage accounting
//!
//! Each backend invocation reports a [`Usage`]; the dispatch loop folds them
//! into a [`UsageStats`] that travels with the run result, with a total and a
//! breakdown per responder.
//!
//! ```rust
//! use tower_handoff::usage::{Usage, UsageStats};
//!
//! let mut stats = UsageStats::new();
//! stats.record("Orchestrator", Usage::new(120, 8));
//! stats.record("Data Expert", Usage::new(400, 250));
//!
//! assert_eq!(stats.total.total_tokens, 778);
//! assert_eq!(stats.total.request_count, 2);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Add;

/// Token usage for a single backend call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    /// Number of backend requests this usage covers.
    pub request_count: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            request_count: 1,
        }
    }

    /// A request that reported no token counts.
    pub fn unreported() -> Self {
        Self {
            request_count: 1,
            ..Self::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
            request_count: self.request_count + other.request_count,
        }
    }
}

/// Usage aggregated over one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStats {
    pub total: Usage,
    pub by_responder: HashMap<String, Usage>,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, responder: &str, usage: Usage) {
        self.total = self.total.clone() + usage.clone();
        let entry = self.by_responder.entry(responder.to_string()).or_default();
        *entry = entry.clone() + usage;
    }

    pub fn summary(&self) -> String {
        let mut names: Vec<_> = self.by_responder.keys().collect();
        names.sort();
        let mut lines = vec![format!(
            "total: {} tokens over {} requests",
            self.total.total_tokens, self.total.request_count
        )];
        for name in names {
            let u = &self.by_responder[name];
            lines.push(format!(
                "  {}: {} prompt + {} completion",
                name, u.prompt_tokens, u.completion_tokens
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_addition() {
        let sum = Usage::new(10, 5) + Usage::new(1, 2);
        assert_eq!(sum.prompt_tokens, 11);
        assert_eq!(sum.completion_tokens, 7);
        assert_eq!(sum.total_tokens, 18);
        assert_eq!(sum.request_count, 2);
    }

    #[test]
    fn test_stats_by_responder() {
        let mut stats = UsageStats::new();
        stats.record("A", Usage::new(10, 1));
        stats.record("B", Usage::unreported());
        stats.record("A", Usage::new(5, 5));

        assert_eq!(stats.total.request_count, 3);
        assert_eq!(stats.by_responder["A"].total_tokens, 21);
        assert_eq!(stats.by_responder["B"].total_tokens, 0);
        assert!(stats.summary().starts_with("total: 21 tokens over 3 requests"));
    }
}
