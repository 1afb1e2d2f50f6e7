//! Run configuration.
//!
//! A [`SearchConfig`] is loaded from a JSON file (every field optional) and
//! then adjusted with the `with_*` builders, typically from command-line
//! overrides. The defaults reproduce the reference setup: three slots polled
//! every five seconds, training `config/chickens.yaml` against
//! `envs/optimization_test.x86_64`, results in `results.csv`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hp_optimizer::{BayesianConfig, BayesianSearch, FixedParams, ObservationStore};
use hp_types::{config_error, HpResult, SearchSpace};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::launcher::{RunLayout, Spawn, TrainerCommand, TrialLauncher};
use crate::scheduler::{PoolScheduler, SchedulerConfig};
use crate::scoring::{EpisodeScorer, ScoringConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub scheduler: SchedulerConfig,
    /// Seconds between scheduler ticks.
    pub poll_interval_secs: u64,
    pub search_space: SearchSpace,
    /// Dimensions pinned for the whole search.
    pub fixed_params: FixedParams,
    pub optimizer: BayesianConfig,
    /// Observation file replayed into the optimizer at startup.
    pub resume_from: Option<PathBuf>,
    /// Observation file appended to as trials complete.
    pub output_file: PathBuf,
    pub trainer: TrainerCommand,
    pub layout: RunLayout,
    pub scoring: ScoringConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            poll_interval_secs: 5,
            search_space: SearchSpace::new()
                .add_float("reproduction_reward", 0.1, 1.0)
                .add_float("time_step_modifier", 1e-7, 1e-4)
                .add_float("pop_reward_modifier", 0.0, 1e-5),
            fixed_params: FixedParams::new(),
            optimizer: BayesianConfig::default(),
            resume_from: None,
            output_file: PathBuf::from("results.csv"),
            trainer: TrainerCommand::default(),
            layout: RunLayout::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl SearchConfig {
    /// Load and validate a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> HpResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HpResult<()> {
        if self.scheduler.num_instances == 0 {
            return Err(config_error!("num_instances must be positive"));
        }
        if self.poll_interval_secs == 0 {
            return Err(config_error!("poll_interval_secs must be positive"));
        }
        if self.scoring.window == 0 {
            return Err(config_error!("scoring window must be positive"));
        }
        if self.scheduler.max_trials == Some(0) {
            return Err(config_error!("max_trials must be positive when set"));
        }
        let last_port = u32::from(self.trainer.base_port) + self.scheduler.num_instances as u32 - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(config_error!(
                "{} instances from base port {} exceed the port range",
                self.scheduler.num_instances,
                self.trainer.base_port
            ));
        }
        self.search_space.validate()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn with_num_instances(mut self, n: usize) -> Self {
        self.scheduler.num_instances = n;
        self
    }

    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.optimizer.seed = seed;
        self
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.scheduler.max_trials = Some(n);
        self
    }

    pub fn with_resume_from<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.resume_from = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_output_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output_file = path.as_ref().to_path_buf();
        self
    }

    /// Candidate source seeded from `resume_from` and persisting to
    /// `output_file`.
    pub fn build_source(&self) -> HpResult<BayesianSearch> {
        let prior = match &self.resume_from {
            Some(path) => Some(ObservationStore::new(path).load(&self.search_space)?),
            None => None,
        };
        let replayed = prior.as_ref().map_or(0, Vec::len);

        let mut source = BayesianSearch::initialize(
            self.search_space.clone(),
            self.fixed_params.clone(),
            prior,
            self.optimizer.clone(),
        )?
        .with_store(ObservationStore::new(&self.output_file));

        if self
            .resume_from
            .as_deref()
            .is_some_and(|resume| same_file(resume, &self.output_file))
        {
            source.mark_persisted();
        }
        info!(
            replayed,
            output = %self.output_file.display(),
            seed = self.optimizer.seed,
            "candidate source ready"
        );
        Ok(source)
    }

    /// Validate and assemble a scheduler that launches trials with `spawner`.
    pub fn build_scheduler<S: Spawn>(
        &self,
        spawner: S,
    ) -> HpResult<PoolScheduler<BayesianSearch, S>> {
        self.validate()?;
        let source = self.build_source()?;
        let launcher = TrialLauncher::new(self.trainer.clone(), self.layout.clone(), spawner);
        let scorer = EpisodeScorer::new(self.scoring.clone());
        Ok(
            PoolScheduler::new(source, launcher, scorer, self.scheduler.clone())
                .with_direction(self.optimizer.direction),
        )
    }
}

/// Path equality that sees through `.`/`..` components and symlinks when
/// both files exist.
fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ProcessSpawner;
    use hp_optimizer::CandidateSource;
    use hp_types::{Candidate, HpError, Observation, ParameterValue, SpaceError};
    use tempfile::tempdir;

    #[test]
    fn defaults_match_reference_setup() {
        let config = SearchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.num_instances, 3);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(
            config.search_space.names().collect::<Vec<_>>(),
            vec!["reproduction_reward", "time_step_modifier", "pop_reward_modifier"]
        );
        assert_eq!(config.output_file, PathBuf::from("results.csv"));
        assert_eq!(config.trainer.base_port, 5000);
        assert_eq!(config.scoring.window, 50);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("search.json");
        std::fs::write(
            &path,
            r#"{
                "scheduler": {"num_instances": 5, "failure_policy": "Hold"},
                "poll_interval_secs": 2,
                "search_space": {"parameters": [
                    {"name": "lr", "kind": {"LogUniform": {"low": 0.0001, "high": 0.1}}}
                ]},
                "optimizer": {"seed": 9},
                "trainer": {"program": "train.sh"}
            }"#,
        )
        .unwrap();

        let config = SearchConfig::from_file(&path).unwrap();
        assert_eq!(config.scheduler.num_instances, 5);
        assert_eq!(config.scheduler.max_trials, None);
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.search_space.len(), 1);
        assert_eq!(config.optimizer.seed, 9);
        assert_eq!(config.optimizer.proposals, 256);
        assert_eq!(config.trainer.program, "train.sh");
        assert_eq!(config.trainer.time_scale, 50.0);
        assert_eq!(config.layout, RunLayout::default());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            SearchConfig::default().with_num_instances(0).validate(),
            Err(HpError::Config(_))
        ));
        assert!(matches!(
            SearchConfig::default().with_poll_interval_secs(0).validate(),
            Err(HpError::Config(_))
        ));

        let mut config = SearchConfig::default();
        config.scoring.window = 0;
        assert!(matches!(config.validate(), Err(HpError::Config(_))));

        let mut config = SearchConfig::default();
        config.trainer.base_port = u16::MAX;
        assert!(matches!(config.validate(), Err(HpError::Config(_))));

        let mut config = SearchConfig::default();
        config.search_space = SearchSpace::new().add_float("x", 1.0, 0.0);
        assert!(matches!(
            config.validate(),
            Err(HpError::Space(SpaceError::InvalidRange { .. }))
        ));
    }

    #[test]
    fn malformed_file_is_a_serialization_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("search.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            SearchConfig::from_file(&path),
            Err(HpError::Serialization(_))
        ));
        assert!(matches!(
            SearchConfig::from_file(dir.path().join("missing.json")),
            Err(HpError::Io(_))
        ));
    }

    fn seeded_results(path: &Path, config: &SearchConfig) -> Vec<Observation> {
        let observations = vec![
            Observation::new(
                Candidate::new()
                    .with("reproduction_reward", ParameterValue::Float(0.5))
                    .with("time_step_modifier", ParameterValue::Float(5e-5))
                    .with("pop_reward_modifier", ParameterValue::Float(0.0)),
                12.0,
            ),
            Observation::new(
                Candidate::new()
                    .with("reproduction_reward", ParameterValue::Float(0.9))
                    .with("time_step_modifier", ParameterValue::Float(1e-6))
                    .with("pop_reward_modifier", ParameterValue::Float(2e-6)),
                7.5,
            ),
        ];
        ObservationStore::new(path)
            .append(&config.search_space, &observations)
            .unwrap();
        observations
    }

    #[test]
    fn resuming_into_the_same_file_does_not_duplicate_rows() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("results.csv");
        let config = SearchConfig::default()
            .with_output_file(&results)
            .with_resume_from(&results);
        let prior = seeded_results(&results, &config);

        let mut source = config.build_source().unwrap();
        assert_eq!(source.observations(), prior.as_slice());
        assert_eq!(source.persist().unwrap(), 0);
        assert_eq!(
            ObservationStore::new(&results)
                .load(&config.search_space)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn resume_path_spelled_differently_is_still_the_output_file() {
        let dir = tempdir().unwrap();
        let results = dir.path().join("results.csv");
        std::fs::create_dir(dir.path().join("runs")).unwrap();
        let config = SearchConfig::default().with_output_file(&results);
        seeded_results(&results, &config);

        for spelling in [
            dir.path().join(".").join("results.csv"),
            dir.path().join("runs").join("..").join("results.csv"),
        ] {
            let mut source = config.clone().with_resume_from(&spelling).build_source().unwrap();
            assert_eq!(source.observations().len(), 2);
            assert_eq!(source.persist().unwrap(), 0);
        }
        assert_eq!(
            ObservationStore::new(&results)
                .load(&config.search_space)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn resuming_into_a_new_file_copies_history() {
        let dir = tempdir().unwrap();
        let previous = dir.path().join("previous.csv");
        let results = dir.path().join("results.csv");
        let config = SearchConfig::default()
            .with_output_file(&results)
            .with_resume_from(&previous);
        let prior = seeded_results(&previous, &config);

        let mut source = config.build_source().unwrap();
        assert_eq!(source.persist().unwrap(), 2);
        assert_eq!(
            ObservationStore::new(&results)
                .load(&config.search_space)
                .unwrap(),
            prior
        );
    }

    #[test]
    fn build_scheduler_sizes_the_pool() {
        let dir = tempdir().unwrap();
        let config = SearchConfig::default()
            .with_num_instances(4)
            .with_max_trials(10)
            .with_seed(3)
            .with_output_file(dir.path().join("results.csv"));
        let scheduler = config.build_scheduler(ProcessSpawner).unwrap();
        assert_eq!(scheduler.slots().len(), 4);
        assert!(scheduler.slots().iter().all(|trial| trial.is_idle()));
        assert_eq!(scheduler.config().max_trials, Some(10));
        assert_eq!(scheduler.source().config().seed, 3);
    }
}
