//! Event types produced by the worker output parser.
//!
//! The worker prints a mix of plain progress lines and marker-prefixed
//! JSON lines on stdout. The parser classifies each complete line into
//! one of these events.

use serde::Deserialize;

/// A classified event extracted from worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A message from Claude, carried as a `__CLAUDE_MESSAGE__` marker line.
    ClaudeMessage {
        /// Message text.
        content: String,
    },
    /// A tool invocation, carried as a `__TOOL_USE__` marker line.
    ToolUse {
        /// Name of the tool being invoked.
        name: String,
        /// Tool input parameters.
        input: serde_json::Value,
    },
    /// A plain progress line from stdout.
    Progress {
        /// Trimmed line text.
        message: String,
    },
    /// A diagnostic line from stderr that looks like a failure.
    Error {
        /// Trimmed line text.
        message: String,
    },
}

/// Payload of a `__CLAUDE_MESSAGE__` marker line.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeMessagePayload {
    /// Message text.
    pub content: String,
}

/// Payload of a `__TOOL_USE__` marker line.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolUsePayload {
    /// Name of the tool being invoked.
    pub name: String,
    /// Tool input parameters.
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Values scraped from worker progress lines over the course of a session.
///
/// Updated by the stdout parser whenever a progress line matches one of
/// the announcement templates; the last match wins. Read once when the
/// session completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionResult {
    /// Identifier of the sandbox the worker provisioned.
    pub sandbox_id: Option<String>,
    /// Preview URL announced by the worker.
    pub preview_url: Option<String>,
}
