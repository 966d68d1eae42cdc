//! Event relay onto the client-facing SSE channel.
//!
//! The relay serializes classified worker events into wire frames and
//! writes them to the channel backing the HTTP response body. It tracks
//! a single open/closed state; a failed write is the one and only signal
//! that the client disconnected.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::worker::{SessionResult, WorkerEvent};

/// Literal payload of the stream-terminating sentinel frame.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Warning attached to a completion with no captured preview URL.
pub const MISSING_PREVIEW_WARNING: &str = "Sandbox started but no preview URL was detected";

/// Outbound wire frame, serialized as the `data:` payload of one SSE event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A message from Claude.
    ClaudeMessage {
        /// Message text.
        content: String,
    },
    /// A tool invocation by the worker.
    ToolUse {
        /// Name of the tool.
        name: String,
        /// Tool input parameters.
        input: serde_json::Value,
    },
    /// A plain progress line.
    Progress {
        /// Progress text.
        message: String,
    },
    /// An error, either from stderr or a terminal failure.
    Error {
        /// Error description.
        message: String,
    },
    /// Terminal completion frame.
    #[serde(rename_all = "camelCase")]
    Complete {
        /// Sandbox identifier captured from progress output, if any.
        sandbox_id: Option<String>,
        /// Preview URL captured from progress output, if any.
        preview_url: Option<String>,
        /// Present when no preview URL was captured.
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
}

impl Frame {
    /// Build the terminal completion frame from the accumulated session
    /// result, attaching a warning when the preview URL is missing.
    #[must_use]
    pub fn complete(result: SessionResult) -> Self {
        let warning = result
            .preview_url
            .is_none()
            .then(|| MISSING_PREVIEW_WARNING.to_string());
        Self::Complete {
            sandbox_id: result.sandbox_id,
            preview_url: result.preview_url,
            warning,
        }
    }
}

impl From<WorkerEvent> for Frame {
    fn from(event: WorkerEvent) -> Self {
        match event {
            WorkerEvent::ClaudeMessage { content } => Self::ClaudeMessage { content },
            WorkerEvent::ToolUse { name, input } => Self::ToolUse { name, input },
            WorkerEvent::Progress { message } => Self::Progress { message },
            WorkerEvent::Error { message } => Self::Error { message },
        }
    }
}

/// Outcome of an [`SseRelay::emit`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// The frame was written to the channel.
    Sent,
    /// The frame was dropped: relay already closed, or the frame could
    /// not be serialized (logged, not a closing condition).
    Dropped,
    /// The write failed because the client went away. The relay is now
    /// closed; the caller must cancel the worker.
    Disconnected,
}

impl EmitOutcome {
    /// Returns true if this outcome signals a client disconnect.
    #[must_use]
    pub fn is_disconnected(self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Relay writing wire frames onto the SSE response channel.
///
/// Each item sent through the channel is the `data:` payload of one SSE
/// event; the HTTP layer wraps it into the event-stream framing. The
/// `closed` flag transitions false to true exactly once and never
/// resets, whether via [`SseRelay::close`] or a detected disconnect.
#[derive(Debug)]
pub struct SseRelay {
    tx: Option<mpsc::Sender<String>>,
    closed: bool,
}

impl SseRelay {
    /// Create a relay and the receiver half backing the response body.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx: Some(tx),
                closed: false,
            },
            rx,
        )
    }

    /// Whether the relay has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Serialize a frame and write it to the client channel.
    ///
    /// A no-op once the relay is closed. A send failure means the
    /// receiver was dropped, i.e. the client disconnected: the relay
    /// closes itself and reports [`EmitOutcome::Disconnected`].
    pub async fn emit(&mut self, frame: Frame) -> EmitOutcome {
        if self.closed {
            return EmitOutcome::Dropped;
        }

        match serde_json::to_string(&frame) {
            Ok(data) => self.send(data).await,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize frame; dropping");
                EmitOutcome::Dropped
            }
        }
    }

    /// Write the `[DONE]` sentinel frame terminating the stream.
    pub async fn send_done(&mut self) -> EmitOutcome {
        if self.closed {
            return EmitOutcome::Dropped;
        }
        self.send(DONE_SENTINEL.to_string()).await
    }

    /// Close the relay, releasing the underlying channel.
    ///
    /// Idempotent; safe to call after a disconnect already closed it.
    pub fn close(&mut self) {
        self.closed = true;
        // Dropping the sender ends the response body stream.
        self.tx.take();
    }

    async fn send(&mut self, data: String) -> EmitOutcome {
        let Some(tx) = self.tx.as_ref() else {
            return EmitOutcome::Dropped;
        };
        match tx.send(data).await {
            Ok(()) => EmitOutcome::Sent,
            Err(_) => {
                tracing::info!("Client channel closed; relay shutting down");
                self.closed = true;
                self.tx.take();
                EmitOutcome::Disconnected
            }
        }
    }
}
