//! Per-request session orchestration.
//!
//! A session spawns the worker, pumps its stdout and stderr through the
//! parser into the relay, waits for exit, emits one terminal frame and
//! the `[DONE]` sentinel, and cleans up exactly once. A client
//! disconnect detected by the relay cancels the worker.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::mpsc;

use crate::config::{Credentials, WorkerConfig, ANTHROPIC_API_KEY_VAR, E2B_API_KEY_VAR};
use crate::relay::{Frame, SseRelay};
use crate::worker::{
    classify_stderr_line, SessionResult, StdoutParser, WorkerCommand, WorkerEvent, WorkerProcess,
};

/// Timeout for graceful worker termination before SIGKILL.
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer size of the channel merging stdout and stderr events.
const EVENT_CHANNEL_BUFFER: usize = 256;

/// Read buffer size for the stdout pump.
const READ_BUFFER_SIZE: usize = 4096;

/// Terminal outcome of the streaming phase.
#[derive(Debug)]
enum StreamOutcome {
    /// Worker exited with code 0.
    Completed(SessionResult),
    /// Worker failed to run to successful completion.
    Failed(String),
    /// Client disconnected; no further frames may be written.
    Disconnected,
}

/// Run one request's session end to end.
///
/// Every error occurring after streaming begins is converted to an
/// in-band `error` frame; nothing is propagated past the relay. Cleanup
/// (worker termination, relay close) runs unconditionally.
pub async fn run_session(
    worker: &WorkerConfig,
    credentials: &Credentials,
    prompt: &str,
    mut relay: SseRelay,
) {
    let command = WorkerCommand::new(&worker.program, prompt)
        .args(worker.args.iter().cloned())
        .env(ANTHROPIC_API_KEY_VAR, &credentials.anthropic_api_key)
        .env(E2B_API_KEY_VAR, &credentials.e2b_api_key);

    tracing::info!(program = %worker.program, "Starting worker session");

    let mut process = match WorkerProcess::spawn(&command) {
        Ok(process) => process,
        Err(e) => {
            tracing::error!(error = %e, "Failed to spawn worker");
            let _ = relay
                .emit(Frame::Error {
                    message: format!("Failed to start worker: {e}"),
                })
                .await;
            let _ = relay.send_done().await;
            relay.close();
            return;
        }
    };

    let outcome = stream_events(&mut process, &mut relay).await;

    match outcome {
        StreamOutcome::Completed(result) => {
            tracing::info!(
                sandbox_id = ?result.sandbox_id,
                preview_url = ?result.preview_url,
                "Worker completed"
            );
            let _ = relay.emit(Frame::complete(result)).await;
            let _ = relay.send_done().await;
        }
        StreamOutcome::Failed(message) => {
            tracing::warn!(%message, "Worker session failed");
            let _ = relay.emit(Frame::Error { message }).await;
            let _ = relay.send_done().await;
        }
        StreamOutcome::Disconnected => {
            tracing::info!("Client disconnected before worker finished");
        }
    }

    // Unconditional cleanup; both operations are idempotent.
    if let Err(e) = process.terminate(TERMINATE_TIMEOUT).await {
        tracing::warn!(error = %e, "Failed to terminate worker during cleanup");
    }
    relay.close();
}

/// Pump parser events to the relay until the worker's pipes close, then
/// resolve the exit status.
async fn stream_events(process: &mut WorkerProcess, relay: &mut SseRelay) -> StreamOutcome {
    let Some(stdout) = process.take_stdout() else {
        return StreamOutcome::Failed("Worker stdout unavailable".to_string());
    };
    let stderr = process.take_stderr();

    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);

    let stdout_task = tokio::spawn(pump_stdout(stdout, tx.clone()));
    let stderr_task = stderr.map(|stderr| tokio::spawn(pump_stderr(stderr, tx)));

    // Drain until both pumps drop their senders (pipes hit EOF), or the
    // relay reports a disconnect.
    let mut disconnected = false;
    while let Some(event) = rx.recv().await {
        if relay.emit(Frame::from(event)).await.is_disconnected() {
            tracing::info!("Relay disconnected; terminating worker");
            if let Err(e) = process.terminate(TERMINATE_TIMEOUT).await {
                tracing::warn!(error = %e, "Failed to terminate worker after disconnect");
            }
            disconnected = true;
            break;
        }
    }
    drop(rx);

    let result = match stdout_task.await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(error = %e, "Stdout pump task failed");
            SessionResult::default()
        }
    };
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    if disconnected {
        return StreamOutcome::Disconnected;
    }

    match process.wait().await {
        Ok(status) if status.success() => StreamOutcome::Completed(result),
        Ok(status) => StreamOutcome::Failed(describe_exit(status.code())),
        Err(e) => StreamOutcome::Failed(format!("Failed to await worker exit: {e}")),
    }
}

/// Read raw stdout chunks through the incremental parser, forwarding
/// events in line-completion order.
async fn pump_stdout(mut stdout: ChildStdout, tx: mpsc::Sender<WorkerEvent>) -> SessionResult {
    let mut parser = StdoutParser::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for event in parser.feed(&buf[..n]) {
                    if tx.send(event).await.is_err() {
                        // Session stopped draining; nothing left to do.
                        return parser.into_result();
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
    parser.into_result()
}

/// Read stderr line by line through the diagnostic classifier.
async fn pump_stderr(stderr: ChildStderr, tx: mpsc::Sender<WorkerEvent>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = classify_stderr_line(&line) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Worker stderr read failed");
                return;
            }
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("Worker exited with code {code}"),
        None => "Worker terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{DONE_SENTINEL, MISSING_PREVIEW_WARNING};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn test_credentials() -> Credentials {
        Credentials {
            anthropic_api_key: "test-anthropic-key".to_string(),
            e2b_api_key: "test-e2b-key".to_string(),
        }
    }

    /// A worker built from an inline shell script; the prompt lands in `$1`.
    fn script_worker(script: &str) -> WorkerConfig {
        WorkerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        }
    }

    async fn collect_frames(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    async fn run_script(script: &str, prompt: &str) -> Vec<String> {
        let worker = script_worker(script);
        let credentials = test_credentials();
        let (relay, rx) = SseRelay::channel(EVENT_CHANNEL_BUFFER);
        let session = run_session(&worker, &credentials, prompt, relay);
        let (frames, ()) = timeout(TEST_TIMEOUT, async {
            tokio::join!(collect_frames(rx), session)
        })
        .await
        .expect("session timed out");
        frames
    }

    #[tokio::test]
    async fn test_successful_session_emits_complete_and_done() {
        let frames = run_script(
            r#"echo "Sandbox created: abc-123"; echo "Preview URL: https://x.y""#,
            "build",
        )
        .await;

        let all = frames.join("\n");
        assert!(all.contains(r#"{"type":"progress","message":"Sandbox created: abc-123"}"#));
        assert!(all.contains(r#""sandboxId":"abc-123""#));
        assert!(all.contains(r#""previewUrl":"https://x.y""#));
        assert!(!all.contains("warning"));
        assert_eq!(frames.last().unwrap(), DONE_SENTINEL);
    }

    #[tokio::test]
    async fn test_missing_preview_url_attaches_warning() {
        let frames = run_script(r#"echo "Sandbox created: abc-123""#, "build").await;

        let all = frames.join("\n");
        assert!(all.contains(r#""sandboxId":"abc-123""#));
        assert!(all.contains(r#""previewUrl":null"#));
        assert!(all.contains(MISSING_PREVIEW_WARNING));
    }

    #[tokio::test]
    async fn test_prompt_reaches_worker_as_positional_argument() {
        let frames = run_script(r#"echo "prompt is $1""#, "hello-world").await;
        assert!(frames
            .iter()
            .any(|frame| frame.contains("prompt is hello-world")));
    }

    #[tokio::test]
    async fn test_nonzero_exit_emits_error_then_done() {
        let frames = run_script("exit 3", "build").await;

        let all = frames.join("\n");
        assert!(all.contains("Worker exited with code 3"));
        assert_eq!(frames.last().unwrap(), DONE_SENTINEL);
        // Exactly one sentinel.
        assert_eq!(
            frames
                .iter()
                .filter(|frame| *frame == DONE_SENTINEL)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stderr_error_lines_are_relayed() {
        let frames = run_script(
            r#"echo "Error: boom" >&2; echo "debug info" >&2; exit 1"#,
            "build",
        )
        .await;

        let all = frames.join("\n");
        assert!(all.contains("Error: boom"));
        assert!(!all.contains("debug info"));
    }

    #[tokio::test]
    async fn test_spawn_failure_emits_error_and_done() {
        let worker = WorkerConfig {
            program: "definitely-not-a-real-binary-12345".to_string(),
            args: Vec::new(),
        };
        let credentials = test_credentials();
        let (relay, rx) = SseRelay::channel(EVENT_CHANNEL_BUFFER);
        let session = run_session(&worker, &credentials, "build", relay);
        let (frames, ()) = timeout(TEST_TIMEOUT, async {
            tokio::join!(collect_frames(rx), session)
        })
        .await
        .expect("session timed out");

        assert!(frames[0].contains("Failed to start worker"));
        assert_eq!(frames[1], DONE_SENTINEL);
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_terminates_worker_and_sends_nothing_more() {
        // Without cancellation this worker would run for 30 seconds.
        let worker = script_worker(
            r#"trap 'exit 0' TERM; for i in $(seq 1 300); do echo "tick $i"; sleep 0.1; done"#,
        );
        let (relay, mut rx) = SseRelay::channel(EVENT_CHANNEL_BUFFER);

        let started = std::time::Instant::now();
        let session = tokio::spawn({
            let worker = worker.clone();
            let credentials = test_credentials();
            async move { run_session(&worker, &credentials, "build", relay).await }
        });

        // Read a couple of frames, then hang up.
        let _ = rx.recv().await;
        let _ = rx.recv().await;
        drop(rx);

        timeout(TEST_TIMEOUT, session)
            .await
            .expect("session timed out")
            .expect("session task panicked");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
