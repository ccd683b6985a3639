use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adapters::manager::AdapterResult;
use crate::execution::{
    ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessOutputLine, ProcessSpawnRequest,
    ProcessTerminationMode, TaskCancellationToken, TaskLogSink, spawn_validated,
};
use crate::models::{CoreError, CoreErrorKind, DependencyType, Operation, TaskId};

/// Bytes of stderr kept on a failure's `detail`.
const STDERR_TAIL_BYTES: usize = 4 * 1024;

pub(crate) async fn run_and_collect_stdout(
    executor: Arc<dyn ProcessExecutor>,
    request: ProcessSpawnRequest,
) -> AdapterResult<String> {
    let program = request.command.program.display().to_string();
    let attribution = attribution_of(&request);

    let process = spawn_validated(executor.as_ref(), request)?;
    let output = process.wait().await?;
    ensure_success(&program, &output, attribution)?;

    String::from_utf8(output.stdout).map_err(|error| {
        attribution.error(
            CoreErrorKind::ManagerExecution,
            format!("'{program}' stdout is not valid UTF-8: {error}"),
        )
    })
}

/// Runs the request with every output line appended to `sink` in arrival
/// order, terminating the child if `cancellation` fires first.
pub(crate) async fn run_streaming(
    executor: Arc<dyn ProcessExecutor>,
    request: ProcessSpawnRequest,
    sink: TaskLogSink,
    cancellation: TaskCancellationToken,
) -> AdapterResult<ProcessOutput> {
    let program = request.command.program.display().to_string();
    let attribution = attribution_of(&request);
    let task_id = sink.task_id();

    let (sender, mut receiver) = mpsc::unbounded_channel::<ProcessOutputLine>();
    let forwarder = tokio::task::spawn_blocking(move || {
        while let Some(line) = receiver.blocking_recv() {
            if let Err(error) = sink.append(line.stream.into(), &line.line) {
                tracing::error!(
                    task_id = %sink.task_id(),
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to append process output to task log"
                );
            }
        }
    });

    let process = match spawn_validated(executor.as_ref(), request.output(sender)) {
        Ok(process) => process,
        Err(error) => {
            join_forwarder(forwarder, task_id).await;
            return Err(error);
        }
    };

    let mut wait = process.wait();
    let finished = tokio::select! {
        result = &mut wait => Some(result),
        () = cancellation.cancelled() => None,
    };

    let Some(result) = finished else {
        if let Err(error) = process.terminate(ProcessTerminationMode::Immediate) {
            tracing::warn!(
                message = %error.message,
                "failed to terminate cancelled process"
            );
        }
        let _ = wait.await;
        join_forwarder(forwarder, task_id).await;
        return Err(attribution.error(
            CoreErrorKind::Cancelled,
            format!("'{program}' was cancelled"),
        ));
    };

    // All lines must be in the log before the caller closes it.
    join_forwarder(forwarder, task_id).await;

    let output = result?;
    ensure_success(&program, &output, attribution)?;
    Ok(output)
}

async fn join_forwarder(forwarder: JoinHandle<()>, task_id: TaskId) {
    if let Err(error) = forwarder.await {
        tracing::error!(
            task_id = %task_id,
            message = %error,
            "task log forwarder failed; output lines may be missing"
        );
    }
}

fn ensure_success(
    program: &str,
    output: &ProcessOutput,
    attribution: Attribution,
) -> AdapterResult<()> {
    let message = match output.status {
        ProcessExitStatus::ExitCode(0) => return Ok(()),
        ProcessExitStatus::ExitCode(code) => format!("'{program}' exited with code {code}"),
        ProcessExitStatus::Terminated => format!("'{program}' was terminated by a signal"),
    };

    let mut error = attribution.error(CoreErrorKind::ManagerExecution, message);
    let tail = stderr_tail(&output.stderr);
    if !tail.is_empty() {
        error = error.with_detail(tail);
    }
    Err(error)
}

pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim_end();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }

    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[derive(Clone, Copy)]
struct Attribution {
    dependency_type: DependencyType,
    operation: Operation,
    task_id: Option<TaskId>,
}

impl Attribution {
    fn error(self, kind: CoreErrorKind, message: String) -> CoreError {
        CoreError {
            dependency_type: Some(self.dependency_type),
            task_id: self.task_id,
            operation: Some(self.operation),
            kind,
            message,
            detail: None,
        }
    }
}

fn attribution_of(request: &ProcessSpawnRequest) -> Attribution {
    Attribution {
        dependency_type: request.dependency_type,
        operation: request.operation,
        task_id: request.task_id,
    }
}
