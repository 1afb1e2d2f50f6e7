//! The instance-pool scheduler.
//!
//! A fixed set of [`Trial`] slots is serviced in index order on every tick:
//! idle slots receive exactly one new candidate, completed slots are scored
//! and their observation is fed back to the [`CandidateSource`] and persisted
//! before the slot is freed. A slot freed during a tick is refilled on the
//! next one.
//!
//! The scheduler owns its slots. [`PoolScheduler::run`] races the tick timer
//! against a caller-supplied shutdown future and terminates its own trials
//! when that future resolves, so no global registry of processes is needed.

use std::future::Future;
use std::time::Duration;

use hp_optimizer::{CandidateSource, ObjectiveDirection, PoolStatus};
use hp_types::{Candidate, Observation, TrialId};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::launcher::{Spawn, TrialLauncher};
use crate::scoring::EpisodeScorer;
use crate::trial::{Terminated, Trial, TrialPoll};

/// What to do with a trial that exited unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Free the slot without producing an observation.
    Recycle,
    /// Leave the slot occupied until shutdown.
    Hold,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Recycle
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of concurrent trial slots.
    pub num_instances: usize,
    pub failure_policy: FailurePolicy,
    /// Stop after this many observations. `None` runs until interrupted.
    pub max_trials: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_instances: 3,
            failure_policy: FailurePolicy::Recycle,
            max_trials: None,
        }
    }
}

/// Events emitted by the scheduler for external consumption (progress
/// output, alerting).
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    TrialStarted {
        slot: usize,
        run_id: TrialId,
        candidate: Candidate,
        pid: Option<u32>,
    },
    LaunchFailed {
        slot: usize,
        run_id: TrialId,
        error: String,
    },
    ObservationRecorded {
        slot: usize,
        run_id: TrialId,
        observation: Observation,
    },
    TrialFailed {
        slot: usize,
        run_id: TrialId,
        exit_code: Option<i32>,
    },
    TrialTerminated(Terminated),
    PersistFailed {
        error: String,
    },
}

/// Why [`PoolScheduler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    BudgetExhausted,
}

pub struct PoolScheduler<C: CandidateSource, S: Spawn> {
    source: C,
    launcher: TrialLauncher<S>,
    scorer: EpisodeScorer,
    config: SchedulerConfig,
    slots: Vec<Trial>,
    /// Slots holding a failed trial under [`FailurePolicy::Hold`].
    held: Vec<bool>,
    status: PoolStatus,
    events: Vec<SchedulerEvent>,
}

impl<C: CandidateSource, S: Spawn> PoolScheduler<C, S> {
    pub fn new(
        source: C,
        launcher: TrialLauncher<S>,
        scorer: EpisodeScorer,
        config: SchedulerConfig,
    ) -> Self {
        let slots = (0..config.num_instances).map(Trial::new).collect();
        let held = vec![false; config.num_instances];
        Self {
            source,
            launcher,
            scorer,
            config,
            slots,
            held,
            status: PoolStatus::new(ObjectiveDirection::default()),
            events: Vec::new(),
        }
    }

    /// Track the best observation in the given direction.
    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.status.direction = direction;
        self
    }

    pub fn source(&self) -> &C {
        &self.source
    }

    pub fn slots(&self) -> &[Trial] {
        &self.slots
    }

    pub fn status(&self) -> &PoolStatus {
        &self.status
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Drain all emitted events (consuming them).
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        std::mem::take(&mut self.events)
    }

    /// True once `max_trials` observations have been produced.
    pub fn budget_exhausted(&self) -> bool {
        self.config
            .max_trials
            .is_some_and(|max| self.status.trials_completed >= max)
    }

    fn launch_allowed(&self) -> bool {
        match self.config.max_trials {
            Some(max) => self.status.trials_completed + self.status.trials_running < max,
            None => true,
        }
    }

    /// Fill every idle slot. Candidates are drawn at random when nothing has
    /// been observed yet, from the model otherwise.
    pub fn bootstrap(&mut self) {
        let idle: Vec<usize> = self
            .slots
            .iter()
            .filter(|trial| trial.is_idle())
            .map(Trial::slot)
            .collect();
        let wanted = match self.config.max_trials {
            Some(max) => idle.len().min(
                max.saturating_sub(self.status.trials_completed + self.status.trials_running),
            ),
            None => idle.len(),
        };
        if wanted == 0 {
            return;
        }

        let candidates = if self.source.observations().is_empty() {
            self.source.sample_random(wanted)
        } else {
            self.source.next(wanted)
        };
        info!(
            count = candidates.len(),
            source = self.source.name(),
            prior = self.source.observations().len(),
            "bootstrapping pool"
        );
        for (slot, candidate) in idle.into_iter().zip(candidates) {
            self.launch(slot, candidate);
        }
    }

    /// Service every slot once, in index order.
    pub fn tick(&mut self) {
        for slot in 0..self.slots.len() {
            match self.slots[slot].poll() {
                TrialPoll::Idle => {
                    if !self.launch_allowed() {
                        continue;
                    }
                    if let Some(candidate) = self.source.next(1).pop() {
                        self.launch(slot, candidate);
                    }
                }
                TrialPoll::Running => {}
                TrialPoll::Completed => self.record_completion(slot),
                TrialPoll::Failed { exit_code } => self.handle_failure(slot, exit_code),
            }
        }
    }

    /// Terminate every active trial. One failure never stops the others.
    pub fn shutdown(&mut self) -> Vec<Terminated> {
        let mut terminated = Vec::new();
        for slot in 0..self.slots.len() {
            if let Some(record) = self.slots[slot].terminate() {
                if !std::mem::take(&mut self.held[slot]) {
                    self.status.mark_stopped();
                }
                self.emit(SchedulerEvent::TrialTerminated(record.clone()));
                terminated.push(record);
            }
        }
        info!(count = terminated.len(), "pool shut down");
        terminated
    }

    /// Bootstrap, then tick every `period` until `shutdown` resolves or the
    /// trial budget is spent, and terminate all trials. Events are handed to
    /// `on_event` as they are produced.
    pub async fn run<F>(
        &mut self,
        period: Duration,
        shutdown: F,
        mut on_event: impl FnMut(&SchedulerEvent),
    ) -> StopReason
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        self.bootstrap();
        self.dispatch(&mut on_event);

        tokio::pin!(shutdown);
        let reason = loop {
            if self.budget_exhausted() {
                info!(completed = self.status.trials_completed, "trial budget exhausted");
                break StopReason::BudgetExhausted;
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("interrupt received, stopping pool");
                    break StopReason::Interrupted;
                }
                _ = ticker.tick() => self.tick(),
            }
            self.dispatch(&mut on_event);
        };

        self.shutdown();
        self.dispatch(&mut on_event);
        reason
    }

    fn dispatch(&mut self, on_event: &mut impl FnMut(&SchedulerEvent)) {
        for event in self.drain_events() {
            on_event(&event);
        }
    }

    fn launch(&mut self, slot: usize, candidate: Candidate) {
        let run_id = candidate.identifier();
        let started = self.slots[slot]
            .start(candidate, &self.launcher)
            .map(|active| (active.candidate.clone(), active.process.pid()));

        match started {
            Ok((candidate, pid)) => {
                self.status.mark_started();
                self.emit(SchedulerEvent::TrialStarted {
                    slot,
                    run_id,
                    candidate,
                    pid,
                });
            }
            Err(e) => {
                error!(slot, run_id = %run_id, error = %e, "failed to launch trial");
                self.status.mark_launch_failed();
                self.emit(SchedulerEvent::LaunchFailed {
                    slot,
                    run_id,
                    error: e.to_string(),
                });
            }
        }
    }

    fn record_completion(&mut self, slot: usize) {
        let score = self.slots[slot].score(&self.scorer);
        let Some(active) = self.slots[slot].active() else {
            return;
        };
        let run_id = active.id.clone();
        let observation = Observation::new(active.candidate.clone(), score);

        self.source.observe(observation.candidate.clone(), score);
        self.status.mark_completed(&observation);
        info!(slot, run_id = %run_id, score, "observation recorded");

        match self.source.persist() {
            Ok(written) => debug!(written, "observations persisted"),
            Err(e) => {
                error!(error = %e, "failed to persist observation");
                self.emit(SchedulerEvent::PersistFailed {
                    error: e.to_string(),
                });
            }
        }
        self.emit(SchedulerEvent::ObservationRecorded {
            slot,
            run_id,
            observation,
        });

        if let Some(record) = self.slots[slot].terminate() {
            self.emit(SchedulerEvent::TrialTerminated(record));
        }
    }

    fn handle_failure(&mut self, slot: usize, exit_code: Option<i32>) {
        if self.held[slot] {
            return;
        }
        let Some(run_id) = self.slots[slot].active().map(|active| active.id.clone()) else {
            return;
        };

        warn!(slot, run_id = %run_id, ?exit_code, policy = ?self.config.failure_policy, "trial failed");
        self.status.mark_failed();
        self.emit(SchedulerEvent::TrialFailed {
            slot,
            run_id,
            exit_code,
        });

        match self.config.failure_policy {
            FailurePolicy::Recycle => {
                if let Some(record) = self.slots[slot].terminate() {
                    self.emit(SchedulerEvent::TrialTerminated(record));
                }
            }
            FailurePolicy::Hold => self.held[slot] = true,
        }
    }

    fn emit(&mut self, event: SchedulerEvent) {
        self.events.push(event);
    }
}
