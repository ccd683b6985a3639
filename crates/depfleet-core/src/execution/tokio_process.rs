use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::execution::{
    ExecutionResult, OutputStream, ProcessExecutor, ProcessExitStatus, ProcessOutput,
    ProcessOutputLine, ProcessOutputSender, ProcessSpawnRequest, ProcessTerminationMode,
    ProcessWaitFuture, RunningProcess,
};
use crate::models::{CoreError, CoreErrorKind, DependencyType, Operation, TaskId};

/// Window granted to output readers after the child exits. Descendants that
/// inherited stdout/stderr can keep the pipes open indefinitely.
const OUTPUT_DRAIN_WINDOW: Duration = Duration::from_millis(250);

pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.process_group(0);

        let attribution = Attribution {
            dependency_type: request.dependency_type,
            operation: request.operation,
            task_id: request.task_id,
        };

        let mut child = cmd.spawn().map_err(|error| {
            attribution.process_failure(format!(
                "failed to spawn '{}': {error}",
                request.command.program.display()
            ))
        })?;

        let pid = child.id();
        let started_at = SystemTime::now();

        // Readers start immediately so lines reach the sender as they are produced.
        let stdout_reader = spawn_line_reader(
            child.stdout.take(),
            OutputStream::Stdout,
            request.output.clone(),
        );
        let stderr_reader =
            spawn_line_reader(child.stderr.take(), OutputStream::Stderr, request.output);

        Ok(Box::new(TokioRunningProcess {
            state: Mutex::new(Some(ChildState {
                child,
                stdout_reader,
                stderr_reader,
            })),
            pid,
            started_at,
            timeout: request.timeout,
            attribution,
        }))
    }
}

struct ChildState {
    child: tokio::process::Child,
    stdout_reader: JoinHandle<Vec<u8>>,
    stderr_reader: JoinHandle<Vec<u8>>,
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

    fn process_failure(self, message: String) -> CoreError {
        self.error(CoreErrorKind::ManagerExecution, message)
    }
}

struct TokioRunningProcess {
    state: Mutex<Option<ChildState>>,
    pid: Option<u32>,
    started_at: SystemTime,
    timeout: Option<Duration>,
    attribution: Attribution,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self, mode: ProcessTerminationMode) -> ExecutionResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };

        let signal = match mode {
            ProcessTerminationMode::Immediate => libc::SIGKILL,
            ProcessTerminationMode::Graceful { .. } => libc::SIGTERM,
        };

        let pgid = -(pid as libc::pid_t);
        let result = unsafe { libc::kill(pgid, signal) };

        if result != 0 {
            let os_error = std::io::Error::last_os_error();
            if os_error.raw_os_error() != Some(libc::ESRCH) {
                return Err(self.attribution.process_failure(format!(
                    "failed to send signal {signal} to process group {pid}: {os_error}"
                )));
            }
        }

        Ok(())
    }

    fn wait(&self) -> ProcessWaitFuture {
        let state = self.state.lock().ok().and_then(|mut slot| slot.take());
        let timeout = self.timeout;
        let started_at = self.started_at;
        let attribution = self.attribution;
        let pid = self.pid;

        Box::pin(async move {
            let ChildState {
                mut child,
                mut stdout_reader,
                mut stderr_reader,
            } = state.ok_or_else(|| {
                attribution.process_failure("child process already consumed".to_string())
            })?;

            let wait_err = |error: std::io::Error| {
                attribution.process_failure(format!("failed to wait for process: {error}"))
            };

            let status = if let Some(timeout_duration) = timeout {
                match tokio::time::timeout(timeout_duration, child.wait()).await {
                    Ok(result) => result.map_err(wait_err)?,
                    Err(_) => {
                        if let Some(pid) = pid {
                            let pgid = -(pid as libc::pid_t);
                            unsafe {
                                libc::kill(pgid, libc::SIGKILL);
                            }
                        }
                        let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                        stdout_reader.abort();
                        stderr_reader.abort();
                        return Err(attribution.process_failure(format!(
                            "process timed out after {}ms",
                            timeout_duration.as_millis()
                        )));
                    }
                }
            } else {
                child.wait().await.map_err(wait_err)?
            };

            let stdout = drain_reader(&mut stdout_reader).await;
            let stderr = drain_reader(&mut stderr_reader).await;

            let status = match status.code() {
                Some(code) => ProcessExitStatus::ExitCode(code),
                None => ProcessExitStatus::Terminated,
            };

            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

fn spawn_line_reader<R>(
    handle: Option<R>,
    stream: OutputStream,
    sender: Option<ProcessOutputSender>,
) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let Some(handle) = handle else {
            return captured;
        };

        let mut reader = BufReader::new(handle);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    captured.extend_from_slice(&line);
                    if let Some(sender) = &sender {
                        let text = String::from_utf8_lossy(&line);
                        let _ = sender.send(ProcessOutputLine {
                            stream,
                            line: text.trim_end_matches(['\r', '\n']).to_string(),
                        });
                    }
                }
            }
        }
        captured
    })
}

async fn drain_reader(reader: &mut JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(OUTPUT_DRAIN_WINDOW, &mut *reader).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            // Aborting drops the reader's sender so downstream consumers can finish.
            reader.abort();
            Vec::new()
        }
    }
}
