use crate::stream::{StreamKind, StreamReader};
use crate::termination::{exit_code, Termination};
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use xtalscreen_core::{ProcessInvocation, ProcessResult, Result, RunnerConfig, XtalscreenError};

/// Timing of the bounded process runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Delay between two checks for child exit
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL
    pub termination_grace: Duration,
    /// How long stream readers may keep draining after the child is gone
    pub reader_grace: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}

impl From<&RunnerConfig> for RunnerSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            termination_grace: config.termination_grace(),
            reader_grace: config.reader_grace(),
        }
    }
}

/// Anything that can execute a [`ProcessInvocation`].
///
/// The screening pipeline only talks to external programs through this
/// trait.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: ProcessInvocation) -> Result<ProcessResult>;
}

/// Runs external commands with concurrent output capture and an optional
/// timeout after which the child is terminated.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    settings: RunnerSettings,
}

impl ProcessRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    /// Run `invocation` to completion or timeout.
    ///
    /// A non-zero exit code or a timeout is reported in the result. Only a
    /// failure to start the command, or to learn its exit status, is an
    /// error. The child is never left running when this returns.
    pub async fn run_process(&self, invocation: ProcessInvocation) -> Result<ProcessResult> {
        let started = Instant::now();
        let command_line = invocation.display();
        let Some((program, args)) = invocation.command.split_first() else {
            return Err(XtalscreenError::Launch {
                command: command_line,
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        if invocation.debug {
            debug!(command = %command_line, timeout = ?invocation.timeout, "Starting process");
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &invocation.env {
            command.env(key, value);
        }
        if let Some(dir) = &invocation.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| XtalscreenError::Launch {
            command: command_line.clone(),
            source,
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(XtalscreenError::Execution(format!(
                "output pipes of {} are not available",
                command_line
            )));
        };
        let stdout = StreamReader::spawn(stdout, StreamKind::Stdout, invocation.echo_stdout);
        let stderr = StreamReader::spawn(stderr, StreamKind::Stderr, invocation.echo_stderr);

        let stdin_writer = match (child.stdin.take(), invocation.stdin.clone()) {
            (Some(mut pipe), Some(payload)) => Some(tokio::spawn(async move {
                let written = pipe.write_all(payload.as_bytes()).await;
                // Dropping the pipe closes it, which is the child's EOF.
                drop(pipe);
                written
            })),
            _ => None,
        };

        // A timeout too large to represent as an instant never expires.
        let deadline = invocation
            .timeout
            .and_then(|timeout| started.checked_add(timeout));
        let mut termination =
            Termination::new(self.settings.termination_grace, self.settings.poll_interval);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    let _ = child.start_kill();
                    return Err(XtalscreenError::Execution(format!(
                        "could not determine exit status of {}: {}",
                        command_line, e
                    )));
                }
            }

            let now = Instant::now();
            match deadline {
                Some(deadline) if now >= deadline => {
                    warn!(
                        command = %command_line,
                        timeout = ?invocation.timeout,
                        "Timeout exceeded, terminating process"
                    );
                    break termination.terminate(&mut child).await.map_err(|e| {
                        XtalscreenError::Execution(format!(
                            "could not terminate {}: {}",
                            command_line, e
                        ))
                    })?;
                }
                Some(deadline) => {
                    tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await
                }
                None => tokio::time::sleep(self.settings.poll_interval).await,
            }
        };

        if let Some(writer) = stdin_writer {
            self.finish_stdin(writer, &command_line).await;
        }

        let grace = self.settings.reader_grace;
        let (stdout, stderr) = tokio::join!(stdout.finish(grace), stderr.finish(grace));

        let result = ProcessResult {
            command: invocation.command.clone(),
            exitcode: exit_code(status),
            stdout,
            stderr,
            runtime: started.elapsed().as_secs_f64(),
            timeout: termination.was_signaled(),
        };

        if invocation.debug {
            debug!(
                command = %command_line,
                exitcode = result.exitcode,
                runtime = result.runtime,
                timeout = result.timeout,
                stdout = %result.stdout,
                stderr = %result.stderr,
                "Process finished"
            );
        }

        Ok(result)
    }

    async fn finish_stdin(&self, mut writer: JoinHandle<io::Result<()>>, command_line: &str) {
        match tokio::time::timeout(self.settings.reader_grace, &mut writer).await {
            Ok(Ok(Ok(()))) => {}
            // The child may exit without reading all of its input.
            Ok(Ok(Err(e))) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(command = %command_line, "Process closed its input early");
            }
            Ok(Ok(Err(e))) => {
                warn!(command = %command_line, error = %e, "Failed to write process input");
            }
            Ok(Err(e)) => {
                warn!(command = %command_line, error = %e, "Input writer task failed");
            }
            Err(_) => {
                warn!(command = %command_line, "Input writer did not finish, abandoning it");
                writer.abort();
            }
        }
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: ProcessInvocation) -> Result<ProcessResult> {
        self.run_process(invocation).await
    }
}

/// Run `invocation` with default runner settings
pub async fn run_process(invocation: ProcessInvocation) -> Result<ProcessResult> {
    ProcessRunner::default().run_process(invocation).await
}
