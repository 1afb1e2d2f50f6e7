//! External trial processes.
//!
//! A trial's work runs in an OS process. The scheduler only ever needs three
//! things from it: a non-blocking exit check, a graceful interrupt, and its
//! pid for logging. [`TrialProcess`] is that seam; [`ChildProcess`] is the
//! real implementation over [`std::process::Child`].

use std::process::{Child, ExitStatus};

use hp_types::TrialError;

/// Non-blocking view of a process's exit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    /// Exited with the given code, or `None` when terminated by a signal.
    Exited(Option<i32>),
}

impl ExitState {
    /// Only an explicit zero exit counts as success.
    pub fn is_success(self) -> bool {
        self == ExitState::Exited(Some(0))
    }
}

pub trait TrialProcess: Send + std::fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Check for exit without blocking.
    fn try_exit(&mut self) -> std::io::Result<ExitState>;

    /// Ask the process to stop (SIGINT on unix).
    fn interrupt(&mut self) -> Result<(), TrialError>;
}

/// A spawned OS child process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    exited: Option<ExitStatus>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            exited: None,
        }
    }
}

impl TrialProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_exit(&mut self) -> std::io::Result<ExitState> {
        if let Some(status) = self.exited {
            return Ok(ExitState::Exited(status.code()));
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.exited = Some(status);
                Ok(ExitState::Exited(status.code()))
            }
            None => Ok(ExitState::Running),
        }
    }

    fn interrupt(&mut self) -> Result<(), TrialError> {
        let pid = self.child.id();
        // A reaped pid may already belong to another process.
        if self.exited.is_some() {
            return Err(TrialError::SignalDelivery {
                pid,
                message: "process already exited".to_string(),
            });
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(|e| {
                TrialError::SignalDelivery {
                    pid,
                    message: e.to_string(),
                }
            })
        }

        #[cfg(not(unix))]
        {
            self.child.kill().map_err(|e| TrialError::SignalDelivery {
                pid,
                message: e.to_string(),
            })
        }
    }
}
