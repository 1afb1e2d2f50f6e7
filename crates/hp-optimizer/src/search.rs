//! Candidate sources: random sampling and a sequential model-based search.

use std::collections::BTreeMap;

use hp_types::{
    Candidate, HpResult, Observation, ParameterDef, ParameterKind, ParameterValue, SearchSpace,
    SpaceError,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::status::ObjectiveDirection;
use crate::store::ObservationStore;

/// Parameters pinned to a fixed value for the whole search.
pub type FixedParams = BTreeMap<String, ParameterValue>;

/// Common trait for all candidate sources.
///
/// Sources are driven from a single control task and are never shared, so
/// implementations hold plain mutable state.
pub trait CandidateSource: Send {
    /// Draw `count` candidates uniformly per dimension, ignoring the model.
    fn sample_random(&mut self, count: usize) -> Vec<Candidate>;

    /// Propose the next `count` candidates given every observation so far.
    fn next(&mut self, count: usize) -> Vec<Candidate>;

    /// Absorb one observation into the model. Not persisted.
    fn observe(&mut self, candidate: Candidate, score: f64);

    /// Flush observations not yet written to the attached store. Returns the
    /// number of rows written.
    fn persist(&mut self) -> HpResult<usize>;

    fn observations(&self) -> &[Observation];

    /// Human-readable source name.
    fn name(&self) -> &str;
}

// ---- Random search ----

/// Independent random sampling across the search space.
///
/// Also owns the bookkeeping shared by every source: fixed parameters, the
/// observation history, and the persistence cursor.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    fixed: FixedParams,
    rng: ChaCha8Rng,
    observations: Vec<Observation>,
    store: Option<ObservationStore>,
    persisted: usize,
}

impl RandomSearch {
    /// Validate `space` and `fixed`, then replay `prior` in order.
    pub fn initialize(
        space: SearchSpace,
        fixed: FixedParams,
        prior: Option<Vec<Observation>>,
        seed: u64,
    ) -> Result<Self, SpaceError> {
        space.validate()?;

        let mut pinned = FixedParams::new();
        for (name, value) in &fixed {
            let param = space
                .get(name)
                .ok_or_else(|| SpaceError::UnknownParameter { name: name.clone() })?;
            pinned.insert(name.clone(), param.coerce(value)?);
        }

        let prior = prior.unwrap_or_default();
        for observation in &prior {
            space.validate_candidate(&observation.candidate)?;
        }
        if !prior.is_empty() {
            info!(count = prior.len(), "replayed prior observations");
        }

        Ok(Self {
            space,
            fixed: pinned,
            rng: ChaCha8Rng::seed_from_u64(seed),
            observations: prior,
            store: None,
            persisted: 0,
        })
    }

    /// Attach the sink used by [`CandidateSource::persist`].
    pub fn with_store(mut self, store: ObservationStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Treat every observation absorbed so far as already persisted, e.g.
    /// when the prior history was loaded from the same file.
    pub fn mark_persisted(&mut self) {
        self.persisted = self.observations.len();
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn fixed(&self) -> &FixedParams {
        &self.fixed
    }

    pub(crate) fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub(crate) fn sample_value(&mut self, param: &ParameterDef) -> ParameterValue {
        if let Some(value) = self.fixed.get(&param.name) {
            return value.clone();
        }
        let rng = &mut self.rng;
        match &param.kind {
            ParameterKind::FloatRange { low, high } => {
                ParameterValue::Float(rng.gen_range(*low..=*high))
            }
            ParameterKind::IntRange { low, high } => {
                ParameterValue::Int(rng.gen_range(*low..=*high))
            }
            ParameterKind::LogUniform { low, high } => {
                let log_low = low.ln();
                let log_high = high.ln();
                let log_val: f64 = rng.gen_range(log_low..=log_high);
                ParameterValue::Float(log_val.exp().clamp(*low, *high))
            }
            ParameterKind::Choice { values } => {
                let idx = rng.gen_range(0..values.len());
                ParameterValue::Json(values[idx].clone())
            }
        }
    }

    fn sample_one(&mut self) -> Candidate {
        let params = self.space.parameters.clone();
        params
            .iter()
            .map(|param| (param.name.clone(), self.sample_value(param)))
            .collect()
    }
}

impl CandidateSource for RandomSearch {
    fn sample_random(&mut self, count: usize) -> Vec<Candidate> {
        (0..count).map(|_| self.sample_one()).collect()
    }

    fn next(&mut self, count: usize) -> Vec<Candidate> {
        self.sample_random(count)
    }

    fn observe(&mut self, candidate: Candidate, score: f64) {
        self.observations.push(Observation::new(candidate, score));
    }

    fn persist(&mut self) -> HpResult<usize> {
        let Some(store) = &self.store else {
            debug!("no observation store attached, skipping persist");
            return Ok(0);
        };
        let pending = &self.observations[self.persisted..];
        let written = store.append(&self.space, pending)?;
        self.persisted = self.observations.len();
        Ok(written)
    }

    fn observations(&self) -> &[Observation] {
        &self.observations
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Bayesian search (kernel surrogate) ----

/// Tuning knobs for [`BayesianSearch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesianConfig {
    pub seed: u64,
    pub direction: ObjectiveDirection,
    /// Fraction of proposals drawn uniformly instead of around the incumbent,
    /// and weight of the uncertainty bonus in the acquisition.
    pub exploration_weight: f64,
    /// Kernel length scale in the unit-normalized space.
    pub length_scale: f64,
    /// Proposals scored per returned candidate.
    pub proposals: usize,
    /// Observations required before the surrogate replaces random sampling.
    pub initial_points: usize,
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            direction: ObjectiveDirection::Maximize,
            exploration_weight: 0.3,
            length_scale: 0.2,
            proposals: 256,
            initial_points: 1,
        }
    }
}

/// A coordinate of a candidate in the unit-normalized space.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Coord {
    Numeric(f64),
    Category(usize),
}

/// Sequential model-based search.
///
/// Fits a Nadaraya-Watson kernel regression to the observed scores, scores a
/// pool of proposals (uniform draws mixed with perturbations of the best
/// point) by mean plus an uncertainty bonus, and keeps the best. Batches are
/// diversified by adding each pick back as a pseudo-observation at its
/// predicted mean before choosing the next.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    random: RandomSearch,
    config: BayesianConfig,
}

impl BayesianSearch {
    pub fn initialize(
        space: SearchSpace,
        fixed: FixedParams,
        prior: Option<Vec<Observation>>,
        config: BayesianConfig,
    ) -> Result<Self, SpaceError> {
        let random = RandomSearch::initialize(space, fixed, prior, config.seed)?;
        Ok(Self { random, config })
    }

    pub fn with_store(mut self, store: ObservationStore) -> Self {
        self.random = self.random.with_store(store);
        self
    }

    pub fn mark_persisted(&mut self) {
        self.random.mark_persisted();
    }

    pub fn config(&self) -> &BayesianConfig {
        &self.config
    }

    fn encode(space: &SearchSpace, candidate: &Candidate) -> Vec<Coord> {
        space
            .parameters
            .iter()
            .map(|param| {
                let value = candidate.get(&param.name);
                match (&param.kind, value) {
                    (ParameterKind::FloatRange { low, high }, Some(v)) => {
                        Coord::Numeric(unit(v.as_f64().unwrap_or(*low), *low, *high))
                    }
                    (ParameterKind::IntRange { low, high }, Some(v)) => Coord::Numeric(unit(
                        v.as_f64().unwrap_or(*low as f64),
                        *low as f64,
                        *high as f64,
                    )),
                    (ParameterKind::LogUniform { low, high }, Some(v)) => Coord::Numeric(unit(
                        v.as_f64().unwrap_or(*low).max(f64::MIN_POSITIVE).ln(),
                        low.ln(),
                        high.ln(),
                    )),
                    (ParameterKind::Choice { values }, Some(ParameterValue::Json(v))) => {
                        Coord::Category(values.iter().position(|c| c == v).unwrap_or(0))
                    }
                    _ => Coord::Numeric(0.0),
                }
            })
            .collect()
    }

    fn sq_distance(a: &[Coord], b: &[Coord]) -> f64 {
        a.iter()
            .zip(b)
            .map(|pair| match pair {
                (Coord::Numeric(x), Coord::Numeric(y)) => (x - y).powi(2),
                (Coord::Category(x), Coord::Category(y)) if x == y => 0.0,
                _ => 1.0,
            })
            .sum()
    }

    /// Posterior-ish mean and uncertainty at `x` over `points` (utility scale).
    fn predict(&self, points: &[(Vec<Coord>, f64)], x: &[Coord]) -> (f64, f64) {
        let n = points.len() as f64;
        let prior_mean = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let variance = points
            .iter()
            .map(|(_, y)| (y - prior_mean).powi(2))
            .sum::<f64>()
            / n;
        let spread = if variance > f64::EPSILON {
            variance.sqrt()
        } else {
            1.0
        };

        let two_l2 = 2.0 * self.config.length_scale.powi(2);
        let mut weight_sum = 0.0;
        let mut weighted = 0.0;
        for (coords, y) in points {
            let w = (-Self::sq_distance(coords, x) / two_l2).exp();
            weight_sum += w;
            weighted += w * y;
        }

        // Shrink toward the prior mean where the data is thin.
        const PRIOR_WEIGHT: f64 = 0.1;
        let mean = (weighted + PRIOR_WEIGHT * prior_mean) / (weight_sum + PRIOR_WEIGHT);
        let uncertainty = spread / (1.0 + weight_sum).sqrt();
        (mean, uncertainty)
    }

    /// Perturb the incumbent, as a local proposal.
    fn perturb(&mut self, base: &Candidate) -> Candidate {
        let params = self.random.space().parameters.clone();
        let mut perturbed = Vec::with_capacity(params.len());

        for param in &params {
            if let Some(value) = self.random.fixed().get(&param.name) {
                perturbed.push((param.name.clone(), value.clone()));
                continue;
            }
            let base_val = base.get(&param.name).cloned();
            let value = match (&param.kind, base_val) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise: f64 = self.random.rng().gen_range(-0.1..0.1) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = self.random.rng().gen_range(-2..=2);
                    ParameterValue::Int(v.saturating_add(delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_range = high.ln() - low.ln();
                    let noise: f64 = self.random.rng().gen_range(-0.1..0.1) * log_range;
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                // Fall back to random for choices or a missing base
                _ => self.random.sample_value(param),
            };
            perturbed.push((param.name.clone(), value));
        }

        perturbed.into_iter().collect()
    }

    fn incumbent(&self) -> Option<Candidate> {
        let direction = self.config.direction;
        self.random
            .observations()
            .iter()
            .filter(|o| o.score.is_finite())
            .reduce(|best, o| {
                if direction.improves(o.score, best.score) {
                    o
                } else {
                    best
                }
            })
            .map(|o| o.candidate.clone())
    }

    fn propose_one(&mut self, points: &[(Vec<Coord>, f64)], incumbent: &Candidate) -> Candidate {
        let space = self.random.space().clone();
        let mut best: Option<(f64, Candidate)> = None;

        for _ in 0..self.config.proposals.max(1) {
            let explore = self.random.rng().gen::<f64>() < self.config.exploration_weight;
            let proposal = if explore {
                self.random.sample_one()
            } else {
                self.perturb(incumbent)
            };
            let (mean, uncertainty) = self.predict(points, &Self::encode(&space, &proposal));
            let acquisition = mean + self.config.exploration_weight * uncertainty;
            if best.as_ref().map_or(true, |(score, _)| acquisition > *score) {
                best = Some((acquisition, proposal));
            }
        }

        best.map(|(_, c)| c)
            .unwrap_or_else(|| self.random.sample_one())
    }
}

fn unit(value: f64, low: f64, high: f64) -> f64 {
    if high > low {
        ((value - low) / (high - low)).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl CandidateSource for BayesianSearch {
    fn sample_random(&mut self, count: usize) -> Vec<Candidate> {
        self.random.sample_random(count)
    }

    fn next(&mut self, count: usize) -> Vec<Candidate> {
        let direction = self.config.direction;
        let space = self.random.space().clone();
        let mut points: Vec<(Vec<Coord>, f64)> = self
            .random
            .observations()
            .iter()
            .filter(|o| o.score.is_finite())
            .map(|o| (Self::encode(&space, &o.candidate), direction.utility(o.score)))
            .collect();

        let incumbent = match self.incumbent() {
            Some(c) if points.len() >= self.config.initial_points.max(1) => c,
            _ => {
                debug!(
                    observations = points.len(),
                    "not enough observations for the surrogate, sampling randomly"
                );
                return self.random.sample_random(count);
            }
        };

        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            let candidate = self.propose_one(&points, &incumbent);
            let coords = Self::encode(&space, &candidate);
            let (mean, _) = self.predict(&points, &coords);
            points.push((coords, mean));
            batch.push(candidate);
        }
        batch
    }

    fn observe(&mut self, candidate: Candidate, score: f64) {
        self.random.observe(candidate, score);
    }

    fn persist(&mut self) -> HpResult<usize> {
        self.random.persist()
    }

    fn observations(&self) -> &[Observation] {
        self.random.observations()
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}
