//! Process-group supervision shared by the test runner and the log monitor.
//!
//! A supervised child is spawned as the leader of its own process group so
//! that everything it forks can be signalled together. Teardown walks
//! `Running -> GraceTermination -> ForceKill -> Reaped`, skipping states that
//! turn out to be unnecessary.

use crate::errors::FuzzError;
use std::process::{Child, Command, ExitStatus};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillPhase {
    Running,
    GraceTermination,
    ForceKill,
    Reaped,
}

pub fn validate_kill_transition(from: KillPhase, to: KillPhase) -> Result<(), FuzzError> {
    use KillPhase as K;

    let allowed = match from {
        K::Running => matches!(to, K::GraceTermination | K::Reaped),
        K::GraceTermination => matches!(to, K::ForceKill | K::Reaped),
        K::ForceKill => matches!(to, K::Reaped),
        K::Reaped => false,
    };
    if !allowed {
        return Err(FuzzError::Process(format!(
            "illegal kill transition: {from:?} -> {to:?}"
        )));
    }
    Ok(())
}

/// How the group leader finished, as seen by the waiter thread.
pub type LeaderExit = Result<ExitStatus, String>;

/// Makes the spawned child the leader of a fresh process group.
pub fn isolate(command: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
}

pub struct GroupSupervisor {
    pgid: u32,
    phase: KillPhase,
    history: Vec<KillPhase>,
    exit_rx: mpsc::Receiver<LeaderExit>,
    leader_exit: Option<LeaderExit>,
    waiter: Option<JoinHandle<()>>,
}

impl GroupSupervisor {
    /// Takes ownership of a child spawned after [`isolate`]. The caller keeps
    /// whatever stdio handles it took out of the child beforehand.
    pub fn watch(mut child: Child) -> Self {
        let pgid = child.id();
        let (tx, exit_rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let status = child.wait().map_err(|e| e.to_string());
            let _ = tx.send(status);
        });
        Self {
            pgid,
            phase: KillPhase::Running,
            history: vec![KillPhase::Running],
            exit_rx,
            leader_exit: None,
            waiter: Some(waiter),
        }
    }

    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    pub fn phase(&self) -> KillPhase {
        self.phase
    }

    pub fn history(&self) -> &[KillPhase] {
        &self.history
    }

    /// Blocks until the group leader exits or `timeout` passes.
    pub fn wait_for_leader(&mut self, timeout: Duration) -> Option<LeaderExit> {
        if self.leader_exit.is_none() {
            match self.exit_rx.recv_timeout(timeout) {
                Ok(status) => self.leader_exit = Some(status),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.leader_exit = Some(Err("process waiter disconnected".to_string()))
                }
            }
        }
        self.leader_exit.clone()
    }

    /// True while any member of the group (leader included) is still present.
    pub fn group_alive(&self) -> bool {
        group_alive(self.pgid)
    }

    /// Signals the whole group with SIGTERM, waits up to `grace` for every
    /// member to go away, then SIGKILLs whatever is left and reaps the leader.
    pub fn terminate(&mut self, grace: Duration) -> LeaderExit {
        if self.phase == KillPhase::Reaped {
            return self.reaped_status();
        }

        if self.group_alive() || self.leader_exit.is_none() {
            self.enter(KillPhase::GraceTermination);
            if let Err(err) = signal_group(self.pgid, GroupSignal::Terminate) {
                tracing::warn!(pgid = self.pgid, error = %err, "SIGTERM to process group failed");
            }

            let deadline = Instant::now().checked_add(grace);
            while deadline.is_some_and(|deadline| Instant::now() < deadline) {
                self.poll_leader();
                if self.leader_exit.is_some() && !self.group_alive() {
                    break;
                }
                thread::sleep(GROUP_POLL_INTERVAL);
            }

            if self.group_alive() {
                self.enter(KillPhase::ForceKill);
                tracing::debug!(pgid = self.pgid, "process group ignored SIGTERM, sending SIGKILL");
                if let Err(err) = signal_group(self.pgid, GroupSignal::Kill) {
                    tracing::warn!(pgid = self.pgid, error = %err, "SIGKILL to process group failed");
                }
            }
        }

        self.reap()
    }

    /// Reaps the leader after it exited on its own. Descendants still in the
    /// group are torn down so nothing outlives the invocation.
    pub fn finish(&mut self, grace: Duration) -> LeaderExit {
        if self.group_alive() {
            tracing::debug!(pgid = self.pgid, "leader exited with live descendants, tearing down group");
            return self.terminate(grace);
        }
        self.reap()
    }

    fn reap(&mut self) -> LeaderExit {
        if self.leader_exit.is_none() {
            let status = self
                .exit_rx
                .recv()
                .map_err(|_| "process waiter disconnected".to_string())
                .and_then(|status| status);
            self.leader_exit = Some(status);
        }
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.join();
        }
        self.enter(KillPhase::Reaped);
        self.reaped_status()
    }

    fn reaped_status(&self) -> LeaderExit {
        self.leader_exit
            .clone()
            .unwrap_or_else(|| Err("process was never reaped".to_string()))
    }

    fn poll_leader(&mut self) {
        if self.leader_exit.is_none() {
            if let Ok(status) = self.exit_rx.try_recv() {
                self.leader_exit = Some(status);
            }
        }
    }

    fn enter(&mut self, next: KillPhase) {
        if validate_kill_transition(self.phase, next).is_ok() {
            self.phase = next;
            self.history.push(next);
        }
    }
}

impl Drop for GroupSupervisor {
    fn drop(&mut self) {
        if self.phase != KillPhase::Reaped {
            let _ = signal_group(self.pgid, GroupSignal::Kill);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: GroupSignal) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    matches!(
        killpg(Pid::from_raw(pgid as i32), None),
        Ok(()) | Err(Errno::EPERM)
    )
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: GroupSignal) -> Result<(), String> {
    Err("process group signalling requires a unix host".to_string())
}

#[cfg(not(unix))]
fn group_alive(_pgid: u32) -> bool {
    false
}
