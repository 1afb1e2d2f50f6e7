//! A single pool slot and the trial running in it.

use chrono::{DateTime, Utc};
use hp_types::{Candidate, TrialError, TrialId};
use tracing::{info, warn};

use crate::launcher::{Invocation, Spawn, TrialLauncher};
use crate::process::{ExitState, TrialProcess};
use crate::scoring::EpisodeScorer;

/// Non-blocking state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPoll {
    Idle,
    Running,
    /// Exited with status zero.
    Completed,
    /// Exited non-zero or by a signal.
    Failed { exit_code: Option<i32> },
}

/// The trial occupying a slot.
#[derive(Debug)]
pub struct ActiveTrial {
    pub candidate: Candidate,
    pub id: TrialId,
    pub invocation: Invocation,
    pub process: Box<dyn TrialProcess>,
    pub started_at: DateTime<Utc>,
}

/// Result of delivering the interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// The process had already exited, so no signal was sent.
    AlreadyExited,
    Failed(String),
}

/// Record of one trial being stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Terminated {
    pub slot: usize,
    pub run_id: TrialId,
    pub pid: Option<u32>,
    pub outcome: SignalOutcome,
}

/// One line per stopped trial, whatever happened to the signal.
impl std::fmt::Display for Terminated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match self.pid {
            Some(pid) => pid.to_string(),
            None => format!("slot {} ({})", self.slot, self.run_id),
        };
        match &self.outcome {
            SignalOutcome::Delivered => write!(f, "Killing {target}"),
            SignalOutcome::AlreadyExited => write!(f, "Stopped {target}, already exited"),
            SignalOutcome::Failed(reason) => write!(f, "Could not interrupt {target}: {reason}"),
        }
    }
}

/// One slot of the pool. Holds at most one trial at a time.
#[derive(Debug)]
pub struct Trial {
    slot: usize,
    active: Option<ActiveTrial>,
}

impl Trial {
    pub fn new(slot: usize) -> Self {
        Self { slot, active: None }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn active(&self) -> Option<&ActiveTrial> {
        self.active.as_ref()
    }

    /// Launch `candidate` in this slot.
    pub fn start<S: Spawn>(
        &mut self,
        candidate: Candidate,
        launcher: &TrialLauncher<S>,
    ) -> Result<&ActiveTrial, TrialError> {
        if self.active.is_some() {
            return Err(TrialError::SlotBusy { slot: self.slot });
        }

        let id = candidate.identifier();
        let (invocation, process) = launcher.launch(self.slot, &id, &candidate)?;
        info!(
            slot = self.slot,
            run_id = %id,
            pid = ?process.pid(),
            port = invocation.port,
            "trial started"
        );

        Ok(&*self.active.insert(ActiveTrial {
            candidate,
            id,
            invocation,
            process,
            started_at: Utc::now(),
        }))
    }

    pub fn poll(&mut self) -> TrialPoll {
        let slot = self.slot;
        let Some(active) = self.active.as_mut() else {
            return TrialPoll::Idle;
        };
        match active.process.try_exit() {
            Ok(ExitState::Running) => TrialPoll::Running,
            Ok(state) if state.is_success() => TrialPoll::Completed,
            Ok(ExitState::Exited(exit_code)) => TrialPoll::Failed { exit_code },
            Err(e) => {
                warn!(slot, run_id = %active.id, error = %e, "cannot query trial process");
                TrialPoll::Running
            }
        }
    }

    /// Score the active trial from its log, 0 when idle.
    pub fn score(&self, scorer: &EpisodeScorer) -> f64 {
        self.active
            .as_ref()
            .map_or(0.0, |active| scorer.score(&active.invocation.log_file))
    }

    /// Interrupt the active trial and reset the slot to idle. Signalling
    /// failures are logged, never returned.
    pub fn terminate(&mut self) -> Option<Terminated> {
        let mut active = self.active.take()?;
        let pid = active.process.pid();

        let exited = matches!(active.process.try_exit(), Ok(ExitState::Exited(_)));
        let outcome = if exited {
            SignalOutcome::AlreadyExited
        } else {
            match active.process.interrupt() {
                Ok(()) => SignalOutcome::Delivered,
                Err(e) => {
                    warn!(slot = self.slot, run_id = %active.id, error = %e, "failed to interrupt trial");
                    SignalOutcome::Failed(e.to_string())
                }
            }
        };

        info!(slot = self.slot, run_id = %active.id, ?pid, ?outcome, "trial terminated");
        Some(Terminated {
            slot: self.slot,
            run_id: active.id,
            pid,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{RunLayout, TrainerCommand};
    use hp_types::ParameterValue;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[derive(Debug)]
    struct ScriptedProcess {
        exit: ExitState,
        interrupts: Arc<Mutex<usize>>,
        refuse_signal: bool,
    }

    impl TrialProcess for ScriptedProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_exit(&mut self) -> std::io::Result<ExitState> {
            Ok(self.exit)
        }

        fn interrupt(&mut self) -> Result<(), TrialError> {
            *self.interrupts.lock() += 1;
            if self.refuse_signal {
                return Err(TrialError::SignalDelivery {
                    pid: 4242,
                    message: "no such process".to_string(),
                });
            }
            Ok(())
        }
    }

    /// Spawns processes frozen in whatever exit state is set at spawn time.
    #[derive(Clone, Default)]
    struct ScriptedSpawner {
        exit: Arc<Mutex<Option<ExitState>>>,
        interrupts: Arc<Mutex<usize>>,
        refuse_signal: bool,
    }

    impl ScriptedSpawner {
        fn set_exit(&self, state: ExitState) {
            *self.exit.lock() = Some(state);
        }
    }

    impl Spawn for ScriptedSpawner {
        fn spawn(&self, _: &Invocation) -> Result<Box<dyn TrialProcess>, TrialError> {
            Ok(Box::new(ScriptedProcess {
                exit: self.exit.lock().unwrap_or(ExitState::Running),
                interrupts: self.interrupts.clone(),
                refuse_signal: self.refuse_signal,
            }))
        }
    }

    fn launcher(dir: &std::path::Path, spawner: ScriptedSpawner) -> TrialLauncher<ScriptedSpawner> {
        TrialLauncher::new(
            TrainerCommand::default(),
            RunLayout::new(dir.join("logs"), dir.join("out")),
            spawner,
        )
    }

    fn candidate(x: f64) -> Candidate {
        Candidate::new().with("reproduction_reward", ParameterValue::Float(x))
    }

    #[test]
    fn idle_slot_polls_idle_and_scores_zero() {
        let mut trial = Trial::new(0);
        assert!(trial.is_idle());
        assert_eq!(trial.poll(), TrialPoll::Idle);
        assert_eq!(trial.score(&EpisodeScorer::default()), 0.0);
        assert!(trial.terminate().is_none());
    }

    #[test]
    fn start_populates_slot_and_rejects_second_start() {
        let dir = tempdir().unwrap();
        let launcher = launcher(dir.path(), ScriptedSpawner::default());
        let mut trial = Trial::new(1);

        let active = trial.start(candidate(0.5), &launcher).unwrap();
        assert_eq!(active.id.as_str(), "reproduction_reward=0.5");
        assert_eq!(active.invocation.port, 5001);
        assert_eq!(trial.poll(), TrialPoll::Running);

        let err = trial.start(candidate(0.6), &launcher).unwrap_err();
        assert!(matches!(err, TrialError::SlotBusy { slot: 1 }));
    }

    #[test]
    fn exit_status_maps_to_poll_state() {
        let dir = tempdir().unwrap();
        let spawner = ScriptedSpawner::default();
        let launcher = launcher(dir.path(), spawner.clone());

        spawner.set_exit(ExitState::Exited(Some(0)));
        let mut ok = Trial::new(0);
        ok.start(candidate(0.2), &launcher).unwrap();
        assert_eq!(ok.poll(), TrialPoll::Completed);

        spawner.set_exit(ExitState::Exited(Some(2)));
        let mut crashed = Trial::new(1);
        crashed.start(candidate(0.3), &launcher).unwrap();
        assert_eq!(crashed.poll(), TrialPoll::Failed { exit_code: Some(2) });

        spawner.set_exit(ExitState::Exited(None));
        let mut killed = Trial::new(2);
        killed.start(candidate(0.4), &launcher).unwrap();
        assert_eq!(killed.poll(), TrialPoll::Failed { exit_code: None });
    }

    #[test]
    fn terminate_signals_running_trial_and_frees_slot() {
        let dir = tempdir().unwrap();
        let spawner = ScriptedSpawner::default();
        let launcher = launcher(dir.path(), spawner.clone());
        let mut trial = Trial::new(0);
        trial.start(candidate(0.5), &launcher).unwrap();

        let terminated = trial.terminate().unwrap();
        assert_eq!(terminated.outcome, SignalOutcome::Delivered);
        assert_eq!(terminated.pid, Some(4242));
        assert_eq!(*spawner.interrupts.lock(), 1);
        assert!(trial.is_idle());
    }

    #[test]
    fn terminate_skips_signal_for_exited_trial() {
        let dir = tempdir().unwrap();
        let spawner = ScriptedSpawner::default();
        spawner.set_exit(ExitState::Exited(Some(0)));
        let launcher = launcher(dir.path(), spawner.clone());
        let mut trial = Trial::new(0);
        trial.start(candidate(0.5), &launcher).unwrap();

        let terminated = trial.terminate().unwrap();
        assert_eq!(terminated.outcome, SignalOutcome::AlreadyExited);
        assert_eq!(*spawner.interrupts.lock(), 0);
        assert!(trial.is_idle());
    }

    #[test]
    fn every_termination_outcome_has_a_notice() {
        let record = |pid, outcome| Terminated {
            slot: 1,
            run_id: candidate(0.5).identifier(),
            pid,
            outcome,
        };
        assert_eq!(record(Some(7), SignalOutcome::Delivered).to_string(), "Killing 7");
        assert_eq!(
            record(Some(7), SignalOutcome::AlreadyExited).to_string(),
            "Stopped 7, already exited"
        );
        assert_eq!(
            record(Some(7), SignalOutcome::Failed("no such process".into())).to_string(),
            "Could not interrupt 7: no such process"
        );
        let unknown = record(None, SignalOutcome::AlreadyExited).to_string();
        assert!(unknown.starts_with("Stopped slot 1 ("), "{unknown}");
    }

    #[test]
    fn signal_failure_is_swallowed() {
        let dir = tempdir().unwrap();
        let spawner = ScriptedSpawner {
            refuse_signal: true,
            ..Default::default()
        };
        let launcher = launcher(dir.path(), spawner);
        let mut trial = Trial::new(0);
        trial.start(candidate(0.5), &launcher).unwrap();

        let terminated = trial.terminate().unwrap();
        assert!(matches!(terminated.outcome, SignalOutcome::Failed(_)));
        assert!(trial.is_idle());
    }

    #[test]
    fn score_reads_the_trial_log() {
        let dir = tempdir().unwrap();
        let launcher = launcher(dir.path(), ScriptedSpawner::default());
        let mut trial = Trial::new(0);
        let log_file = trial
            .start(candidate(0.5), &launcher)
            .unwrap()
            .invocation
            .log_file
            .clone();
        std::fs::write(
            &log_file,
            r#"{"episodes": [{"numCreatures": [1, 1, 1]}, {"numCreatures": [1, 1, 1, 1, 1]}]}"#,
        )
        .unwrap();
        assert_eq!(trial.score(&EpisodeScorer::default()), 4.0);
    }
}
