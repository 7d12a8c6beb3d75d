//! Adapter SPI: what the core requires of each tool domain.
//!
//! Adapters are data plus one synchronous execute entry point. The core
//! never inspects domain semantics: it validates tool-call shape against the
//! declared schema, executes, and treats runtime errors as learning signal.

pub mod fluxtool;
pub mod gridtool;

pub use fluxtool::FluxtoolAdapter;
pub use gridtool::GridtoolAdapter;

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

/// Declared tool surface: name, description, and a JSON-schema object for
/// the input shape. The schema is plain data so shape validation and prompt
/// rendering never depend on adapter code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Result of one tool execution. An error here is data for the learning
/// loop, never a session failure.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub output: String,
    pub error: Option<String>,
    /// Optional adapter state summary after the call, used for no-progress
    /// fingerprints.
    pub state_delta: Option<String>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
            state_delta: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: Some(error.into()),
            state_delta: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A local documentation source the strict-mode critic may retrieve from.
#[derive(Debug, Clone)]
pub struct DomainDoc {
    pub doc_id: String,
    pub title: String,
    pub path: PathBuf,
    pub tags: Vec<String>,
}

/// The contract every domain adapter satisfies.
///
/// `execute` must be synchronous from the core's viewpoint and must not
/// panic on malformed payloads: shape validation runs first, and anything
/// past it that the domain rejects comes back as `ToolOutcome::error`.
pub trait ToolAdapter: Send {
    /// Stable short domain key, e.g. `cli:gridtool`. Scopes the strict lane.
    fn domain_key(&self) -> String;

    /// Tool family used as the fingerprint prefix, e.g. `gridtool`.
    fn tool_family(&self) -> String;

    /// Declared tools for this domain.
    fn tool_spec(&self) -> Vec<ToolSpec>;

    /// Domain-specific instructions appended to the system prompt.
    fn system_prompt_fragment(&self) -> String;

    /// Materialize fixture state inside the session sandbox.
    fn bootstrap(&mut self, work_dir: &Path) -> anyhow::Result<()>;

    /// Execute one validated tool call.
    fn execute(&mut self, tool_name: &str, payload: &serde_json::Value) -> ToolOutcome;

    /// Evidence string for the referee: final observable state.
    fn capture_final_state(&self) -> String;

    /// Local docs consulted by the strict-mode critic. Default: none.
    fn docs_manifest(&self) -> Vec<DomainDoc> {
        Vec::new()
    }
}

/// Resolve a domain name to its adapter.
pub fn resolve_adapter(domain: &str) -> crate::error::Result<Box<dyn ToolAdapter>> {
    match domain {
        "gridtool" => Ok(Box::new(GridtoolAdapter::new())),
        "fluxtool" => Ok(Box::new(FluxtoolAdapter::new())),
        other => Err(crate::error::AgentError::Setup(format!(
            "unknown domain: {other:?} (available: gridtool, fluxtool)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_domains() {
        assert_eq!(resolve_adapter("gridtool").unwrap().domain_key(), "cli:gridtool");
        assert_eq!(resolve_adapter("fluxtool").unwrap().domain_key(), "cli:fluxtool");
        assert!(resolve_adapter("nope").is_err());
    }
}
