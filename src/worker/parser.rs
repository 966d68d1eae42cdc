//! Incremental parser for the worker's line-oriented stdout protocol.
//!
//! The worker writes marker-prefixed JSON lines for structured events and
//! plain text lines for progress. Chunks arrive at arbitrary boundaries,
//! so the parser buffers the trailing incomplete line between `feed`
//! calls; feeding the same bytes in any partition yields the same events.

use regex::Regex;

use crate::worker::events::{
    ClaudeMessagePayload, SessionResult, ToolUsePayload, WorkerEvent,
};

/// Marker prefix for Claude message lines.
pub const CLAUDE_MESSAGE_MARKER: &str = "__CLAUDE_MESSAGE__";
/// Marker prefix for tool invocation lines.
pub const TOOL_USE_MARKER: &str = "__TOOL_USE__";
/// Marker prefix for tool result lines (consumed but never emitted).
pub const TOOL_RESULT_MARKER: &str = "__TOOL_RESULT__";

/// Delimiter substring shared by all markers. Plain lines containing it
/// are dropped rather than forwarded as progress.
const MARKER_DELIMITER: &str = "__";

/// Prefixes of tooling noise the worker's runtime writes to stdout.
const INTERNAL_LOG_PREFIXES: &[&str] = &[
    "[dotenv",
    "npm warn",
    "npm notice",
    "Debugger attached",
    "Debugger ending",
];

/// Fixed template announcing the sandbox identifier.
const SANDBOX_PATTERN: &str = r"(?i)sandbox created:\s*([A-Za-z0-9_-]+)";
/// Fixed template announcing the preview URL.
const PREVIEW_PATTERN: &str = r"(?i)preview url:\s*(https?://\S+)";

/// Stateful parser turning raw stdout chunks into [`WorkerEvent`]s.
///
/// Also accumulates the [`SessionResult`] scraped from progress lines.
/// The announcement templates are brittle on purpose: they mirror the
/// worker's exact wording, and a wording change silently loses the
/// value rather than erroring.
#[derive(Debug)]
pub struct StdoutParser {
    buffer: Vec<u8>,
    result: SessionResult,
    sandbox_pattern: Option<Regex>,
    preview_pattern: Option<Regex>,
}

impl Default for StdoutParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StdoutParser {
    /// Create a new parser with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            result: SessionResult::default(),
            sandbox_pattern: compile_pattern(SANDBOX_PATTERN),
            preview_pattern: compile_pattern(PREVIEW_PATTERN),
        }
    }

    /// Feed a chunk of stdout bytes, returning the events for every line
    /// completed by this chunk.
    ///
    /// The trailing fragment without a line terminator stays buffered as
    /// raw bytes until a later chunk completes it, so a multi-byte UTF-8
    /// character split across chunks still decodes intact.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<WorkerEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(event) = self.classify_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Get the accumulated session result so far.
    #[must_use]
    pub fn result(&self) -> &SessionResult {
        &self.result
    }

    /// Consume the parser, yielding the accumulated session result.
    #[must_use]
    pub fn into_result(self) -> SessionResult {
        self.result
    }

    /// Classify a single complete line. Markers take priority over plain
    /// text; malformed marker payloads are dropped, not surfaced.
    fn classify_line(&mut self, line: &str) -> Option<WorkerEvent> {
        if let Some(payload) = line.strip_prefix(CLAUDE_MESSAGE_MARKER) {
            return match serde_json::from_str::<ClaudeMessagePayload>(payload.trim()) {
                Ok(message) => Some(WorkerEvent::ClaudeMessage {
                    content: message.content,
                }),
                Err(e) => {
                    tracing::debug!(error = %e, "Dropping malformed claude message line");
                    None
                }
            };
        }

        if let Some(payload) = line.strip_prefix(TOOL_USE_MARKER) {
            return match serde_json::from_str::<ToolUsePayload>(payload.trim()) {
                Ok(tool_use) => Some(WorkerEvent::ToolUse {
                    name: tool_use.name,
                    input: tool_use.input,
                }),
                Err(e) => {
                    tracing::debug!(error = %e, "Dropping malformed tool use line");
                    None
                }
            };
        }

        if line.starts_with(TOOL_RESULT_MARKER) {
            // Parsed structure is not needed downstream; drop to cut noise.
            tracing::trace!("Dropping tool result line");
            return None;
        }

        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.contains(MARKER_DELIMITER)
            || INTERNAL_LOG_PREFIXES
                .iter()
                .any(|prefix| trimmed.starts_with(prefix))
        {
            return None;
        }

        self.extract_announcements(trimmed);
        Some(WorkerEvent::Progress {
            message: trimmed.to_string(),
        })
    }

    /// Scan a progress message for sandbox/preview announcements,
    /// overwriting any previously captured value.
    fn extract_announcements(&mut self, message: &str) {
        if let Some(id) = capture(self.sandbox_pattern.as_ref(), message) {
            self.result.sandbox_id = Some(id);
        }
        if let Some(url) = capture(self.preview_pattern.as_ref(), message) {
            self.result.preview_url = Some(url);
        }
    }
}

/// Classify a single stderr line.
///
/// Stderr is diagnostic-only; lines mentioning `Error` or `Failed` become
/// error events, everything else is dropped.
#[must_use]
pub fn classify_stderr_line(line: &str) -> Option<WorkerEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains("Error") || trimmed.contains("Failed") {
        return Some(WorkerEvent::Error {
            message: trimmed.to_string(),
        });
    }
    None
}

fn compile_pattern(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "Failed to compile announcement pattern");
            None
        }
    }
}

fn capture(pattern: Option<&Regex>, message: &str) -> Option<String> {
    pattern?
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(parser: &mut StdoutParser, input: &str) -> Vec<WorkerEvent> {
        parser.feed(input.as_bytes())
    }

    #[test]
    fn test_claude_message_marker() {
        let mut parser = StdoutParser::new();
        let events = feed_str(&mut parser, "__CLAUDE_MESSAGE__ {\"content\": \"hi\"}\n");
        assert_eq!(
            events,
            vec![WorkerEvent::ClaudeMessage {
                content: "hi".to_string()
            }]
        );
    }

    #[test]
    fn test_malformed_marker_payload_yields_nothing() {
        let mut parser = StdoutParser::new();
        let events = feed_str(&mut parser, "__CLAUDE_MESSAGE__ {not json\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_tool_use_marker() {
        let mut parser = StdoutParser::new();
        let events = feed_str(
            &mut parser,
            "__TOOL_USE__ {\"name\": \"Bash\", \"input\": {\"command\": \"ls\"}}\n",
        );
        assert_eq!(
            events,
            vec![WorkerEvent::ToolUse {
                name: "Bash".to_string(),
                input: serde_json::json!({"command": "ls"}),
            }]
        );
    }

    #[test]
    fn test_tool_result_marker_is_dropped() {
        let mut parser = StdoutParser::new();
        let events = feed_str(
            &mut parser,
            "__TOOL_RESULT__ {\"tool_use_id\": \"t1\", \"content\": \"ok\"}\n",
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_plain_line_becomes_progress() {
        let mut parser = StdoutParser::new();
        let events = feed_str(&mut parser, "  Installing dependencies...  \n");
        assert_eq!(
            events,
            vec![WorkerEvent::Progress {
                message: "Installing dependencies...".to_string()
            }]
        );
    }

    #[test]
    fn test_empty_and_noise_lines_are_dropped() {
        let mut parser = StdoutParser::new();
        let input = "\n   \n[dotenv@16.4.5] injecting env\nnpm warn deprecated\nDebugger attached.\n";
        assert!(feed_str(&mut parser, input).is_empty());
    }

    #[test]
    fn test_line_with_marker_delimiter_is_dropped() {
        let mut parser = StdoutParser::new();
        let events = feed_str(&mut parser, "leftover __TOOL_USE__ fragment\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let input = "Step one\n__CLAUDE_MESSAGE__ {\"content\": \"hi\"}\nSandbox created: abc-123\nPreview URL: https://x.y\n";

        let mut whole = StdoutParser::new();
        let expected = whole.feed(input.as_bytes());

        // Byte-at-a-time is the worst-case partition.
        let mut split = StdoutParser::new();
        let mut actual = Vec::new();
        for byte in input.as_bytes() {
            actual.extend(split.feed(&[*byte]));
        }

        assert_eq!(expected, actual);
        assert_eq!(whole.result(), split.result());
    }

    #[test]
    fn test_multibyte_characters_survive_chunk_boundaries() {
        let input = "Construyendo la aplicación\n";

        let mut whole = StdoutParser::new();
        let expected = whole.feed(input.as_bytes());

        let mut split = StdoutParser::new();
        let mut actual = Vec::new();
        for byte in input.as_bytes() {
            actual.extend(split.feed(&[*byte]));
        }

        assert_eq!(expected, actual);
        assert_eq!(
            actual,
            vec![WorkerEvent::Progress {
                message: "Construyendo la aplicación".to_string()
            }]
        );
    }

    #[test]
    fn test_incomplete_line_stays_buffered() {
        let mut parser = StdoutParser::new();
        assert!(feed_str(&mut parser, "partial progre").is_empty());
        let events = feed_str(&mut parser, "ss line\n");
        assert_eq!(
            events,
            vec![WorkerEvent::Progress {
                message: "partial progress line".to_string()
            }]
        );
    }

    #[test]
    fn test_crlf_terminators() {
        let mut parser = StdoutParser::new();
        let events = feed_str(&mut parser, "Building project\r\n");
        assert_eq!(
            events,
            vec![WorkerEvent::Progress {
                message: "Building project".to_string()
            }]
        );
    }

    #[test]
    fn test_sandbox_announcement_extraction() {
        let mut parser = StdoutParser::new();
        feed_str(&mut parser, "Sandbox created: abc-123\n");
        assert_eq!(parser.result().sandbox_id.as_deref(), Some("abc-123"));
        assert!(parser.result().preview_url.is_none());
    }

    #[test]
    fn test_preview_announcement_extraction() {
        let mut parser = StdoutParser::new();
        feed_str(&mut parser, "Preview URL: https://x.y\n");
        assert_eq!(parser.result().preview_url.as_deref(), Some("https://x.y"));
    }

    #[test]
    fn test_last_announcement_wins() {
        let mut parser = StdoutParser::new();
        feed_str(
            &mut parser,
            "Sandbox created: first-id\nSandbox created: second-id\n",
        );
        assert_eq!(parser.result().sandbox_id.as_deref(), Some("second-id"));
    }

    #[test]
    fn test_into_result() {
        let mut parser = StdoutParser::new();
        feed_str(&mut parser, "Sandbox created: abc-123\n");
        let result = parser.into_result();
        assert_eq!(result.sandbox_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_stderr_error_line() {
        let event = classify_stderr_line("Error: boom").unwrap();
        assert_eq!(
            event,
            WorkerEvent::Error {
                message: "Error: boom".to_string()
            }
        );
    }

    #[test]
    fn test_stderr_failed_line() {
        assert!(classify_stderr_line("Failed to compile").is_some());
    }

    #[test]
    fn test_stderr_diagnostic_line_dropped() {
        assert!(classify_stderr_line("debug info").is_none());
        assert!(classify_stderr_line("   ").is_none());
    }
}
