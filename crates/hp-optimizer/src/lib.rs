//! # hp-optimizer
//!
//! Candidate generation and search bookkeeping for HyperPool.
//!
//! Provides the [`CandidateSource`] contract with random and sequential
//! model-based implementations, CSV persistence of observations for resuming
//! a search, and aggregate progress tracking for a pool run.

mod search;
mod status;
mod store;

pub use search::{BayesianConfig, BayesianSearch, CandidateSource, FixedParams, RandomSearch};
pub use status::{ObjectiveDirection, PoolStatus};
pub use store::{ObservationStore, SCORE_COLUMN};
