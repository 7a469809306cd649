//! Bounded-concurrency subprocess execution for handlers.
//!
//! Each dispatch expands the handler's command template, waits for a
//! semaphore permit, and runs the command through the shell with a
//! deadline. Captured output is capped per stream; a process that outlives
//! its deadline gets SIGTERM, a short grace period, then SIGKILL. Every
//! path records a dispatch row before returning.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use metarelay_core::{
    DispatchOutcome, DispatchRecord, Event, EventStore, HandlerConfig, HandlerDispatcher,
    StoreError,
};
use metarelay_handlers::expand_command;

/// Per-stream capture cap. Excess output is dropped with a marker.
const OUTPUT_CAP_BYTES: usize = 64 * 1024;

/// Time between SIGTERM and SIGKILL for a timed-out process.
const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct ProcessDispatcher {
    store: Arc<dyn EventStore>,
    semaphore: Arc<Semaphore>,
}

impl ProcessDispatcher {
    pub fn new(store: Arc<dyn EventStore>, concurrency: usize) -> Self {
        Self {
            store,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

#[async_trait]
impl HandlerDispatcher for ProcessDispatcher {
    async fn dispatch(
        &self,
        handler: &HandlerConfig,
        event: &Event,
    ) -> Result<DispatchRecord, StoreError> {
        let command = expand_command(&handler.command, event);
        tracing::info!(
            handler = %handler.name,
            event_id = event.id,
            %command,
            "dispatching handler"
        );

        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| StoreError::Backend("dispatcher semaphore closed".to_string()))?;
        let record = run_command(handler, event, &command).await;
        drop(permit);

        self.store.record_dispatch(&record)?;
        Ok(record)
    }
}

async fn run_command(handler: &HandlerConfig, event: &Event, command: &str) -> DispatchRecord {
    let started_at = Utc::now();
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string());

    let mut builder = Command::new(&shell);
    builder
        .arg("-lc")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match builder.spawn() {
        Ok(child) => child,
        Err(error) => {
            return DispatchRecord {
                remote_id: event.id,
                handler_name: handler.name.clone(),
                outcome: DispatchOutcome::Failure,
                exit_status: None,
                stdout: String::new(),
                stderr: format!("failed to launch '{shell}': {error}"),
                started_at,
                ended_at: Utc::now(),
            };
        }
    };

    let stdout_reader = spawn_capped_reader(child.stdout.take());
    let stderr_reader = spawn_capped_reader(child.stderr.take());

    let deadline = Duration::from_secs(handler.timeout_seconds.max(1));
    let (outcome, exit_status) = match timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => {
            let outcome = if status.success() {
                DispatchOutcome::Success
            } else {
                DispatchOutcome::Failure
            };
            (outcome, exit_code(&status))
        }
        Ok(Err(error)) => {
            tracing::warn!(handler = %handler.name, %error, "failed waiting on handler process");
            (DispatchOutcome::Failure, None)
        }
        Err(_) => {
            let status = terminate(&mut child).await;
            (
                DispatchOutcome::Timeout,
                status.as_ref().and_then(exit_code),
            )
        }
    };

    let stdout = finish_capture(stdout_reader).await;
    let mut stderr = finish_capture(stderr_reader).await;
    if outcome == DispatchOutcome::Timeout {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "command timed out after {} s",
            handler.timeout_seconds
        ));
    }

    DispatchRecord {
        remote_id: event.id,
        handler_name: handler.name.clone(),
        outcome,
        exit_status,
        stdout,
        stderr,
        started_at,
        ended_at: Utc::now(),
    }
}

fn spawn_capped_reader<R>(stream: Option<R>) -> Option<tokio::task::JoinHandle<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut stream = stream?;
    Some(tokio::spawn(async move {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer).await;
        buffer
    }))
}

async fn finish_capture(reader: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let bytes = reader.await.unwrap_or_default();
    truncate_output(&String::from_utf8_lossy(&bytes))
}

fn truncate_output(value: &str) -> String {
    if value.len() <= OUTPUT_CAP_BYTES {
        return value.to_string();
    }
    let mut end = OUTPUT_CAP_BYTES;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut output = value[..end].to_string();
    output.push_str("\n<output truncated>");
    output
}

/// SIGTERM, a short grace period, then SIGKILL. Returns the final exit
/// status when the process was reaped.
async fn terminate(child: &mut Child) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if let Ok(Ok(status)) = timeout(KILL_GRACE, child.wait()).await {
            return Some(status);
        }
    }

    let _ = child.kill().await;
    child.wait().await.ok()
}

/// Exit code, or the negated signal number for a signalled death.
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|signal| -signal)
    }
    #[cfg(not(unix))]
    {
        None
    }
}
