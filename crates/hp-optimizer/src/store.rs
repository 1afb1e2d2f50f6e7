//! Append-only CSV persistence for observations.
//!
//! One header row with the dimension names in declared order followed by
//! `score`, then one row per observation.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use hp_types::{Candidate, HpResult, Observation, SearchSpace, SpaceError, StoreError};
use tracing::{debug, info};

/// Name of the trailing score column.
pub const SCORE_COLUMN: &str = "score";

fn csv_error(path: &Path, err: csv::Error) -> StoreError {
    StoreError::Csv {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Durable sink for observations.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationStore {
    path: PathBuf,
}

impl ObservationStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(space: &SearchSpace) -> Vec<String> {
        space
            .names()
            .map(str::to_string)
            .chain(std::iter::once(SCORE_COLUMN.to_string()))
            .collect()
    }

    /// Load every persisted observation. A missing file is an empty history.
    pub fn load(&self, space: &SearchSpace) -> HpResult<Vec<Observation>> {
        let path = self.path.as_path();
        if !path.exists() {
            debug!(path = %path.display(), "no observation file, starting fresh");
            return Ok(Vec::new());
        }

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| csv_error(path, e))?;

        let expected = Self::header(space);
        let found: Vec<String> = rdr
            .headers()
            .map_err(|e| csv_error(path, e))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if found != expected {
            return Err(StoreError::HeaderMismatch {
                path: path.display().to_string(),
                expected,
                found,
            }
            .into());
        }

        let malformed = |line: usize, message: String| StoreError::Malformed {
            path: path.display().to_string(),
            line,
            message,
        };

        let mut observations = Vec::new();
        for (idx, result) in rdr.records().enumerate() {
            // Header is line 1.
            let line = idx + 2;
            let record = result.map_err(|e| csv_error(path, e))?;
            if record.len() != expected.len() {
                return Err(malformed(
                    line,
                    format!("expected {} fields, found {}", expected.len(), record.len()),
                )
                .into());
            }

            let mut values = Vec::with_capacity(space.len());
            for (param, raw) in space.parameters.iter().zip(record.iter()) {
                let value = param
                    .parse(raw)
                    .map_err(|e: SpaceError| malformed(line, e.to_string()))?;
                values.push((param.name.clone(), value));
            }
            let raw_score = record.get(space.len()).unwrap_or_default().trim();
            let score: f64 = raw_score
                .parse()
                .map_err(|_| malformed(line, format!("invalid score {raw_score:?}")))?;

            observations.push(Observation::new(values.into_iter().collect(), score));
        }

        info!(
            path = %path.display(),
            count = observations.len(),
            "loaded persisted observations"
        );
        Ok(observations)
    }

    /// Append `observations`, writing the header first if the file is new or
    /// empty. Returns the number of rows written.
    pub fn append(&self, space: &SearchSpace, observations: &[Observation]) -> HpResult<usize> {
        if observations.is_empty() {
            return Ok(0);
        }
        let path = self.path.as_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let needs_header = file.metadata()?.len() == 0;
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(file);

        if needs_header {
            wtr.write_record(Self::header(space))
                .map_err(|e| csv_error(path, e))?;
        }
        for observation in observations {
            wtr.write_record(Self::row(space, &observation.candidate, observation.score)?)
                .map_err(|e| csv_error(path, e))?;
        }
        wtr.flush()?;

        debug!(path = %path.display(), rows = observations.len(), "appended observations");
        Ok(observations.len())
    }

    fn row(space: &SearchSpace, candidate: &Candidate, score: f64) -> Result<Vec<String>, SpaceError> {
        let mut row = Vec::with_capacity(space.len() + 1);
        for name in space.names() {
            let value = candidate.get(name).ok_or_else(|| SpaceError::MissingValue {
                name: name.to_string(),
            })?;
            row.push(value.to_string());
        }
        row.push(score.to_string());
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_types::{HpError, ParameterValue};
    use serde_json::json;
    use tempfile::tempdir;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .add_float("reproduction_reward", 0.1, 1.0)
            .add_int("layers", 1, 4)
            .add_choice("optimizer", vec![json!("adam"), json!("sgd")])
    }

    fn observation(reward: f64, layers: i64, optimizer: &str, score: f64) -> Observation {
        Observation::new(
            Candidate::new()
                .with("reproduction_reward", ParameterValue::Float(reward))
                .with("layers", ParameterValue::Int(layers))
                .with("optimizer", ParameterValue::Json(json!(optimizer))),
            score,
        )
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = ObservationStore::new(dir.path().join("results.csv"));
        assert!(store.load(&space()).unwrap().is_empty());
    }

    #[test]
    fn append_then_load_preserves_order_and_values() {
        let dir = tempdir().unwrap();
        let store = ObservationStore::new(dir.path().join("nested").join("results.csv"));
        let space = space();

        let first = vec![observation(0.5, 2, "adam", 12.25)];
        let second = vec![
            observation(0.123456789, 4, "sgd", 3.0),
            observation(1.0, 1, "adam", 0.0),
        ];
        assert_eq!(store.append(&space, &first).unwrap(), 1);
        assert_eq!(store.append(&space, &second).unwrap(), 2);

        let loaded = store.load(&space).unwrap();
        let expected: Vec<Observation> = first.into_iter().chain(second).collect();
        assert_eq!(loaded, expected);

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(text.lines().next(), Some("reproduction_reward,layers,optimizer,score"));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn header_mismatch_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");
        std::fs::write(&path, "a,b,score\n1,2,3\n").unwrap();

        let err = ObservationStore::new(&path).load(&space()).unwrap_err();
        assert!(matches!(err, HpError::Store(StoreError::HeaderMismatch { .. })));
    }

    #[test]
    fn out_of_bounds_row_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");
        std::fs::write(
            &path,
            "reproduction_reward,layers,optimizer,score\n0.5,9,adam,1.0\n",
        )
        .unwrap();

        let err = ObservationStore::new(&path).load(&space()).unwrap_err();
        match err {
            HpError::Store(StoreError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed row, got {other:?}"),
        }
    }

    #[test]
    fn empty_append_does_not_create_file() {
        let dir = tempdir().unwrap();
        let store = ObservationStore::new(dir.path().join("results.csv"));
        assert_eq!(store.append(&space(), &[]).unwrap(), 0);
        assert!(!store.path().exists());
    }
}
