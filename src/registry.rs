//! # Responder Registry
//!
//! A responder is a named participant with a scope summary, system
//! instructions, and the set of other responders it may hand the conversation
//! to. The [`Registry`] owns every responder for the lifetime of the process
//! and stores the transfer graph as an adjacency set keyed by name, so the
//! graph can be built, serialized and checked without running anything.
//!
//! Validation happens once, in [`RegistryBuilder::build`]: every transfer
//! target must resolve to a registered responder, and a designated root must
//! exist. The graph may contain cycles; bounding them is the dispatch loop's
//! job.
//!
//! ```rust
//! use tower_handoff::registry::{Registry, Responder};
//!
//! let mut builder = Registry::builder();
//! builder
//!     .register(Responder::new("Triage", "Route the question.").with_transfer("Billing"))
//!     .unwrap();
//! builder
//!     .register(Responder::new("Billing", "Answer billing questions.").with_scope("Invoices"))
//!     .unwrap();
//! let registry = builder.root("Triage").build().unwrap();
//!
//! assert_eq!(registry.root().unwrap().name(), "Triage");
//! assert!(!registry.get("Billing").unwrap().can_transfer_to("Triage"));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DispatchError, Result};

/// Immutable description of one responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Responder {
    name: String,
    /// When to use this responder. Shown to the model as a routing hint; the
    /// runtime never matches on it.
    #[serde(default)]
    scope: String,
    instructions: String,
    /// Names this responder may transfer to, in declaration order.
    #[serde(default)]
    transfers: Vec<String>,
    /// Model override for this responder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

impl Responder {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: String::new(),
            instructions: instructions.into(),
            transfers: Vec::new(),
            model: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Permit a transfer to `target`. Adding the same target twice is a no-op.
    pub fn with_transfer(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        if !self.transfers.contains(&target) {
            self.transfers.push(target);
        }
        self
    }

    pub fn with_transfers<I, S>(self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        targets
            .into_iter()
            .fold(self, |responder, t| responder.with_transfer(t))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn transfers(&self) -> &[String] {
        &self.transfers
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn can_transfer_to(&self, target: &str) -> bool {
        self.transfers.iter().any(|t| t == target)
    }
}

/// Serializable form of a registry, used for files and export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(default, rename = "responder")]
    pub responders: Vec<Responder>,
}

/// Collects responders and validates the transfer graph on [`build`](Self::build).
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    responders: HashMap<String, Arc<Responder>>,
    order: Vec<String>,
    root: Option<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a responder, failing if the name is taken.
    pub fn register(&mut self, responder: Responder) -> Result<&mut Self> {
        if self.responders.contains_key(responder.name()) {
            return Err(DispatchError::DuplicateName {
                name: responder.name().to_string(),
            });
        }
        self.order.push(responder.name().to_string());
        self.responders
            .insert(responder.name().to_string(), Arc::new(responder));
        Ok(self)
    }

    /// Designate the entry point for every run.
    pub fn root(&mut self, name: impl Into<String>) -> &mut Self {
        self.root = Some(name.into());
        self
    }

    /// Validate the transfer graph and freeze the registry.
    pub fn build(&mut self) -> Result<Registry> {
        for name in &self.order {
            let responder = &self.responders[name];
            for target in responder.transfers() {
                if !self.responders.contains_key(target) {
                    return Err(DispatchError::DanglingTransfer {
                        from: name.clone(),
                        to: target.clone(),
                    });
                }
            }
        }

        if let Some(root) = &self.root {
            if !self.responders.contains_key(root) {
                return Err(DispatchError::UnknownResponder { name: root.clone() });
            }
        }

        let registry = Registry {
            responders: std::mem::take(&mut self.responders),
            order: std::mem::take(&mut self.order),
            root: self.root.take(),
        };

        if registry.root.is_some() {
            let reachable = registry.reachable_from_root();
            for name in &registry.order {
                if !reachable.contains(name.as_str()) {
                    warn!(responder = %name, "responder is not reachable from the root");
                }
            }
        }
        debug!(
            responders = registry.len(),
            root = ?registry.root,
            "registry built"
        );

        Ok(registry)
    }
}

/// Read-only set of responders plus the designated root.
///
/// Safe to share across concurrent runs behind an `Arc`; nothing mutates it
/// after construction.
#[derive(Debug, Clone)]
pub struct Registry {
    responders: HashMap<String, Arc<Responder>>,
    order: Vec<String>,
    root: Option<String>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Build and validate a registry from its serializable form.
    pub fn from_spec(spec: RegistrySpec) -> Result<Self> {
        let mut builder = RegistryBuilder::new();
        for responder in spec.responders {
            builder.register(responder)?;
        }
        if let Some(root) = spec.root {
            builder.root(root);
        }
        builder.build()
    }

    /// Parse a TOML document of the shape
    ///
    /// ```toml
    /// root = "Triage"
    ///
    /// [[responder]]
    /// name = "Triage"
    /// instructions = "Route the question."
    /// transfers = ["Billing"]
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let spec: RegistrySpec = toml::from_str(source)?;
        Self::from_spec(spec)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Export the registry in declaration order.
    pub fn to_spec(&self) -> RegistrySpec {
        RegistrySpec {
            root: self.root.clone(),
            responders: self.iter().map(|r| (**r).clone()).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&Arc<Responder>> {
        self.responders
            .get(name)
            .ok_or_else(|| DispatchError::UnknownResponder {
                name: name.to_string(),
            })
    }

    pub fn root(&self) -> Result<&Arc<Responder>> {
        let name = self.root.as_deref().ok_or(DispatchError::NoRootConfigured)?;
        self.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.responders.contains_key(name)
    }

    /// Resolve a responder's transfer-set, in declaration order.
    pub fn targets_of(&self, name: &str) -> Result<Vec<Arc<Responder>>> {
        self.get(name)?
            .transfers()
            .iter()
            .map(|t| self.get(t).cloned())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Responder>> {
        self.order.iter().map(move |n| &self.responders[n])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Names reachable from the root by following permitted transfers.
    pub fn reachable_from_root(&self) -> HashSet<&str> {
        let mut seen = HashSet::new();
        let Some(root) = self.root.as_deref() else {
            return seen;
        };
        let mut queue = VecDeque::from([root]);
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(responder) = self.responders.get(name) {
                queue.extend(responder.transfers().iter().map(String::as_str));
            }
        }
        seen
    }
}

/// Ready-made registries.
pub mod presets {
    use super::{Registry, Responder, Result};

    pub const ORCHESTRATOR: &str = "Orchestrator";
    pub const PRODUCT_EXPERT: &str = "Product Expert";
    pub const SOFTWARE_EXPERT: &str = "Software Expert";
    pub const DATA_EXPERT: &str = "Data Expert";

    /// A router in front of three experts that assess feature feasibility
    /// from the business, code and data angles.
    pub fn feasibility_panel() -> Result<Registry> {
        let mut builder = Registry::builder();
        builder
            .register(
                Responder::new(
                    PRODUCT_EXPERT,
                    "You answer questions about the business logic of a product and assess the feasability of new features.",
                )
                .with_scope("Specialist agent with full knowledge of a product's business use cases"),
            )?
            .register(
                Responder::new(
                    SOFTWARE_EXPERT,
                    "You explain technical details about a product and assess the feasability of new features.",
                )
                .with_scope("Specialist agent with deep technical knowledge of a product's codebase"),
            )?
            .register(
                Responder::new(
                    DATA_EXPERT,
                    "You explain technical details about the data and database for a product and assess the feasability of new features.",
                )
                .with_scope("Specialist agent with deep technical knowledge of a product's database"),
            )?
            .register(
                Responder::new(
                    ORCHESTRATOR,
                    "You determine which agent to use based on the user's question",
                )
                .with_model("gpt-4o")
                .with_transfers([PRODUCT_EXPERT, SOFTWARE_EXPERT, DATA_EXPERT]),
            )?;
        builder.root(ORCHESTRATOR).build()
    }
}
