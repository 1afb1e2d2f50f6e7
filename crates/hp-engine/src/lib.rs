//! # hp-engine
//!
//! Runs a hyperparameter search as a fixed pool of external training
//! processes.
//!
//! - [`process`]: the [`TrialProcess`] seam over OS child processes.
//! - [`launcher`]: builds the training command line and spawns it.
//! - [`scoring`]: turns a trial's JSON episode log into a scalar score.
//! - [`trial`]: one pool slot and its lifecycle.
//! - [`scheduler`]: the tick loop that refills slots and feeds scores back
//!   to the candidate source.
//! - [`config`]: file-backed run configuration.

pub mod config;
pub mod launcher;
pub mod process;
pub mod scheduler;
pub mod scoring;
pub mod trial;

pub use config::SearchConfig;
pub use launcher::{Invocation, ProcessSpawner, RunLayout, Spawn, TrainerCommand, TrialLauncher};
pub use process::{ChildProcess, ExitState, TrialProcess};
pub use scheduler::{FailurePolicy, PoolScheduler, SchedulerConfig, SchedulerEvent, StopReason};
pub use scoring::{EpisodeScorer, ScoringConfig};
pub use trial::{ActiveTrial, SignalOutcome, Terminated, Trial, TrialPoll};
