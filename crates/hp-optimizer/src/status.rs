//! Objective direction and aggregate progress of a search run.

use chrono::{DateTime, Utc};
use hp_types::Observation;
use serde::{Deserialize, Serialize};

/// Whether we are maximizing or minimizing the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

impl ObjectiveDirection {
    /// True if `candidate` strictly improves on `incumbent`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            ObjectiveDirection::Maximize => candidate > incumbent,
            ObjectiveDirection::Minimize => candidate < incumbent,
        }
    }

    /// Map a raw score onto a scale where larger is always better.
    pub fn utility(self, score: f64) -> f64 {
        match self {
            ObjectiveDirection::Maximize => score,
            ObjectiveDirection::Minimize => -score,
        }
    }
}

/// Aggregate status of a pool run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub direction: ObjectiveDirection,
    pub trials_started: usize,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub launch_failures: usize,
    pub trials_running: usize,
    pub best: Option<Observation>,
    pub started_at: DateTime<Utc>,
    pub last_observation_at: Option<DateTime<Utc>>,
}

impl PoolStatus {
    pub fn new(direction: ObjectiveDirection) -> Self {
        Self {
            direction,
            trials_started: 0,
            trials_completed: 0,
            trials_failed: 0,
            launch_failures: 0,
            trials_running: 0,
            best: None,
            started_at: Utc::now(),
            last_observation_at: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.trials_started += 1;
        self.trials_running += 1;
    }

    pub fn mark_launch_failed(&mut self) {
        self.launch_failures += 1;
    }

    pub fn mark_completed(&mut self, observation: &Observation) {
        self.trials_completed += 1;
        self.trials_running = self.trials_running.saturating_sub(1);
        self.last_observation_at = Some(Utc::now());
        self.update_best(observation);
    }

    pub fn mark_failed(&mut self) {
        self.trials_failed += 1;
        self.trials_running = self.trials_running.saturating_sub(1);
    }

    /// A trial stopped without producing an observation (interrupt or
    /// shutdown).
    pub fn mark_stopped(&mut self) {
        self.trials_running = self.trials_running.saturating_sub(1);
    }

    /// Update the best observation if `observation` improves on it.
    pub fn update_best(&mut self, observation: &Observation) {
        let dominated = match &self.best {
            None => true,
            Some(current) => self.direction.improves(observation.score, current.score),
        };
        if dominated {
            self.best = Some(observation.clone());
        }
    }
}
