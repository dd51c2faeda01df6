//! Tool catalog: per-server cache of discovered tool descriptors.
//!
//! Provides:
//! - Wholesale replacement of a server's tools after each `tools/list`
//! - Lookup by `(server id, tool name)`; names are only unique per server
//! - A merged cross-server view
//! - Required-argument checks against a tool's input schema

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use super::errors::McpError;
use super::types::{ToolArguments, ToolDescriptor};

/// Maximum "did you mean" suggestions attached to `ToolNotFound`.
const MAX_SUGGESTIONS: usize = 3;

/// Minimum similarity (0.0–1.0) for a name to be suggested.
const MIN_SIMILARITY: f64 = 0.5;

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// Discovered tools for every connected server.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    /// `server_id → tools`, replaced as a unit.
    servers: RwLock<HashMap<String, Arc<Vec<ToolDescriptor>>>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything known about a server's tools.
    ///
    /// If the server lists a name twice, the first entry wins.
    pub fn replace(&self, server_id: &str, tools: Vec<ToolDescriptor>) {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(tools.len());
        for tool in tools {
            if seen.insert(tool.name.clone()) {
                unique.push(tool);
            } else {
                tracing::warn!(server = %server_id, tool = %tool.name, "duplicate tool name ignored");
            }
        }

        let count = unique.len();
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_id.to_string(), Arc::new(unique));
        tracing::debug!(server = %server_id, count, "catalog replaced");
    }

    /// Drop all tools belonging to a server.
    pub fn remove(&self, server_id: &str) {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
    }

    fn entry(&self, server_id: &str) -> Option<Arc<Vec<ToolDescriptor>>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned()
    }

    pub fn contains_server(&self, server_id: &str) -> bool {
        self.entry(server_id).is_some()
    }

    /// Tools of one server, in discovery order.
    pub fn tools_for(&self, server_id: &str) -> Vec<ToolDescriptor> {
        self.entry(server_id)
            .map(|tools| tools.as_ref().clone())
            .unwrap_or_default()
    }

    /// Look up one tool.
    pub fn get(&self, server_id: &str, tool_name: &str) -> Option<ToolDescriptor> {
        self.entry(server_id)?
            .iter()
            .find(|t| t.name == tool_name)
            .cloned()
    }

    /// Sorted tool names of one server.
    pub fn tool_names(&self, server_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .entry(server_id)
            .map(|tools| tools.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn tool_count(&self, server_id: &str) -> usize {
        self.entry(server_id).map_or(0, |tools| tools.len())
    }

    /// Every tool of every server, ordered by `(server id, tool name)`.
    pub fn merged(&self) -> Vec<ToolDescriptor> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<ToolDescriptor> = servers
            .values()
            .flat_map(|tools| tools.iter().cloned())
            .collect();
        drop(servers);
        all.sort_by(|a, b| (&a.server_id, &a.name).cmp(&(&b.server_id, &b.name)));
        all
    }

    /// Total number of tools across servers.
    pub fn len(&self) -> usize {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|tools| tools.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a tool for execution and check its required arguments.
    ///
    /// Fails with `ToolNotFound` (listing the server's tools) or
    /// `MissingArguments` (naming every absent key).
    pub fn resolve_call(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: &ToolArguments,
    ) -> Result<ToolDescriptor, McpError> {
        let Some(tool) = self.get(server_id, tool_name) else {
            let available = self.tool_names(server_id);
            let suggestions = find_similar(tool_name, &available, MAX_SUGGESTIONS);
            return Err(McpError::ToolNotFound {
                server: server_id.to_string(),
                tool: tool_name.to_string(),
                available,
                suggestions,
            });
        };

        let missing = missing_required(&tool, arguments);
        if !missing.is_empty() {
            return Err(McpError::MissingArguments {
                tool: tool_name.to_string(),
                missing,
            });
        }

        Ok(tool)
    }
}

/// Required keys of `tool`'s schema absent from `arguments`, in schema order.
pub fn missing_required(tool: &ToolDescriptor, arguments: &ToolArguments) -> Vec<String> {
    tool.input_schema
        .required()
        .into_iter()
        .filter(|key| !arguments.contains_key(*key))
        .map(str::to_string)
        .collect()
}

// ─── Suggestions ─────────────────────────────────────────────────────────────

/// Up to `max_results` names from `candidates` resembling `name`, best first.
pub fn find_similar(name: &str, candidates: &[String], max_results: usize) -> Vec<String> {
    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .map(|c| (similarity(name, c), c))
        .filter(|(score, _)| *score >= MIN_SIMILARITY)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(max_results)
        .map(|(_, c)| c.clone())
        .collect()
}

/// Edit distance between two strings, by character.
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Normalized similarity: 1.0 for identical strings, 0.0 for disjoint ones.
fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

// ─── Tests ───────────────────────────────────────────────────────────────────
