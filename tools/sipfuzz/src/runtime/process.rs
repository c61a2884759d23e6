use crate::runtime::supervisor::{isolate, GroupSupervisor, DEFAULT_KILL_GRACE};
use crate::runtime::{Clock, ProcessRequest, ProcessRunner};
use crate::types::{ExecutionOutcome, FAILED_EXIT_CODE};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct ProductionProcessRunner {
    clock: Arc<dyn Clock>,
    kill_grace_millis: AtomicU64,
}

impl ProductionProcessRunner {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            kill_grace_millis: AtomicU64::new(millis(DEFAULT_KILL_GRACE)),
        }
    }

    pub fn with_kill_grace(self, kill_grace: Duration) -> Self {
        self.set_kill_grace(kill_grace);
        self
    }

    fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis.load(Ordering::Relaxed))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ProcessRunner for ProductionProcessRunner {
    fn set_kill_grace(&self, grace: Duration) {
        self.kill_grace_millis.store(millis(grace), Ordering::Relaxed);
    }

    fn run(&self, request: &ProcessRequest, timeout: Duration) -> ExecutionOutcome {
        let started_at = self.clock.now();
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        isolate(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(program = %request.program, error = %err, "test invocation failed to spawn");
                return ExecutionOutcome::runner_error(
                    format!("failed to spawn {}: {err}", request.program),
                    started_at,
                    self.clock.now(),
                );
            }
        };
        let stdout = child.stdout.take().map(capture);
        let stderr = child.stderr.take().map(capture);
        let mut supervisor = GroupSupervisor::watch(child);
        tracing::debug!(pgid = supervisor.pgid(), command = %request.command_line(), "test invocation started");

        let (status, timed_out) = match supervisor.wait_for_leader(timeout) {
            Some(_) => (supervisor.finish(self.kill_grace()), false),
            None => {
                tracing::warn!(pgid = supervisor.pgid(), ?timeout, "test invocation timed out, terminating process group");
                (supervisor.terminate(self.kill_grace()), true)
            }
        };

        let stdout = collect(stdout);
        let mut stderr = collect(stderr);
        let ended_at = self.clock.now();

        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("timed out after {timeout:?}"));
            return ExecutionOutcome::timed_out(stdout, stderr, started_at, ended_at);
        }

        match status {
            Ok(status) => ExecutionOutcome::completed(
                status.code().unwrap_or(FAILED_EXIT_CODE),
                stdout,
                stderr,
                started_at,
                ended_at,
            ),
            Err(err) => ExecutionOutcome::runner_error(
                format!("failed to wait for {}: {err}", request.program),
                started_at,
                ended_at,
            ),
        }
    }
}

fn capture<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(err) = reader.read_to_end(&mut buffer) {
            tracing::debug!(error = %err, captured = buffer.len(), "output capture read failed");
        }
        buffer
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
