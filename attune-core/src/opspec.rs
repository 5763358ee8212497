//! OpSpec module routing.
//!
//! An OpSpec is the instruction block that tells the assistant how to talk
//! to this particular user. It is assembled from modular fragments: each
//! module fires on trigger phrases (priority-0 modules always fire), may
//! name modules it conflicts with, and sorts by priority.
//!
//! Conflict removal is global: the union of every selected module's
//! `conflicts_with` list is removed from the selection. Two modules that
//! name each other both disappear.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// One instruction fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSpecModule {
    /// Stable identifier.
    pub id: String,
    /// Sort key, ascending. Priority 0 is always included.
    pub priority: u32,
    /// Instruction text.
    pub content: String,
    /// Lower-case phrases; any substring hit selects the module.
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Ids removed from the output whenever this module is selected.
    #[serde(default)]
    pub conflicts_with: Vec<String>,
}

impl OpSpecModule {
    fn fires_on(&self, lowered: &str) -> bool {
        self.priority == 0
            || self
                .triggers
                .iter()
                .any(|t| !t.is_empty() && lowered.contains(&t.to_lowercase()))
    }
}

/// The assembled OpSpec for one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutedOpSpec {
    /// Ids of the modules that survived, in output order.
    pub module_ids: Vec<String>,
    /// Module contents joined with a blank line.
    pub content: String,
}

/// Select and order modules for a message against a catalog.
#[must_use]
pub fn route(catalog: &[OpSpecModule], message: &str) -> RoutedOpSpec {
    let lowered = message.to_lowercase();

    let mut seen = HashSet::new();
    let mut selected: Vec<&OpSpecModule> = catalog
        .iter()
        .filter(|m| m.fires_on(&lowered))
        .filter(|m| seen.insert(m.id.as_str()))
        .collect();

    let conflicts: HashSet<&str> = selected
        .iter()
        .flat_map(|m| m.conflicts_with.iter().map(String::as_str))
        .collect();
    selected.retain(|m| !conflicts.contains(m.id.as_str()));

    // Stable: equal priorities keep catalog order.
    selected.sort_by_key(|m| m.priority);

    RoutedOpSpec {
        module_ids: selected.iter().map(|m| m.id.clone()).collect(),
        content: selected
            .iter()
            .map(|m| m.content.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// Router holding a swappable catalog.
///
/// The catalog is replaced wholesale when the stored catalog changes;
/// in-flight routes keep the snapshot they started with.
#[derive(Debug)]
pub struct OpSpecRouter {
    catalog: RwLock<Arc<Vec<OpSpecModule>>>,
}

impl OpSpecRouter {
    /// Router over a given catalog.
    #[must_use]
    pub fn new(catalog: Vec<OpSpecModule>) -> Self {
        Self {
            catalog: RwLock::new(Arc::new(catalog)),
        }
    }

    /// Router over the built-in catalog.
    #[must_use]
    pub fn with_default_catalog() -> Self {
        Self::new(default_catalog())
    }

    /// Route a message against the current catalog.
    #[must_use]
    pub fn route(&self, message: &str) -> RoutedOpSpec {
        let snapshot = Arc::clone(&self.catalog.read());
        route(&snapshot, message)
    }

    /// Replace the catalog.
    pub fn replace_catalog(&self, catalog: Vec<OpSpecModule>) {
        tracing::info!(modules = catalog.len(), "opspec catalog replaced");
        *self.catalog.write() = Arc::new(catalog);
    }

    /// Parse a JSON catalog and install it.
    ///
    /// # Errors
    /// Returns `AttuneError::Serialization` if the payload is not a module list;
    /// the current catalog stays in place.
    pub fn reload_from_json(&self, json: &str) -> crate::error::Result<()> {
        let catalog: Vec<OpSpecModule> = serde_json::from_str(json)?;
        self.replace_catalog(catalog);
        Ok(())
    }

    /// Number of modules in the current catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.catalog.read().len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OpSpecRouter {
    fn default() -> Self {
        Self::with_default_catalog()
    }
}

fn module(id: &str, priority: u32, content: &str, triggers: &[&str], conflicts: &[&str]) -> OpSpecModule {
    OpSpecModule {
        id: id.to_string(),
        priority,
        content: content.to_string(),
        triggers: triggers.iter().map(|s| (*s).to_string()).collect(),
        conflicts_with: conflicts.iter().map(|s| (*s).to_string()).collect(),
    }
}

/// The built-in module catalog.
#[must_use]
pub fn default_catalog() -> Vec<OpSpecModule> {
    vec![
        module(
            "core",
            0,
            "Speak to this user as someone who already knows them. Use what you know \
             about them only where it changes the answer.",
            &[],
            &[],
        ),
        module(
            "brevity",
            10,
            "Keep it short: lead with the answer, at most a few sentences.",
            &["tl;dr", "quick question", "briefly", "short answer", "in a nutshell"],
            &["depth"],
        ),
        module(
            "depth",
            10,
            "Go deep: walk through the reasoning step by step and name the trade-offs.",
            &["explain", "in detail", "deep dive", "walk me through", "why does"],
            &["brevity"],
        ),
        module(
            "support",
            20,
            "Lead with acknowledgement before advice. Do not stack suggestions.",
            &["overwhelmed", "anxious", "scared", "stuck", "can't cope", "exhausted"],
            &["challenge"],
        ),
        module(
            "challenge",
            20,
            "Push back honestly. Point out weak assumptions before agreeing.",
            &["push back", "devil's advocate", "poke holes", "be honest", "roast"],
            &[],
        ),
        module(
            "decision",
            30,
            "Help them decide: surface the one or two criteria that actually matter \
             to them and ask which way they lean.",
            &["should i", "decide", "choose", "torn between", "which one"],
            &[],
        ),
        module(
            "planning",
            30,
            "Turn intent into a plan with concrete, dated next steps.",
            &["plan", "schedule", "roadmap", "next steps"],
            &[],
        ),
    ]
}
