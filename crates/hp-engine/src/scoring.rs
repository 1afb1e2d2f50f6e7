//! Trial scoring from the structured episode log.

use std::path::Path;

use hp_types::TrialError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Where the score lives inside a trial's JSON log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Top-level key holding the ordered episode records.
    pub episodes_key: String,
    /// Per-episode field; an array counts its length, a number counts as is.
    pub metric_field: String,
    /// Number of trailing episodes averaged.
    pub window: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            episodes_key: "episodes".to_string(),
            metric_field: "numCreatures".to_string(),
            window: 50,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EpisodeScorer {
    config: ScoringConfig,
}

impl EpisodeScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Metric values of the last `window` episodes, oldest first.
    ///
    /// An empty file yields no values. Episodes without a usable metric field
    /// are skipped.
    pub fn read_last(&self, path: &Path) -> Result<Vec<f64>, TrialError> {
        let log_read = |message: String| TrialError::LogRead {
            path: path.display().to_string(),
            message,
        };

        let text = std::fs::read_to_string(path).map_err(|e| log_read(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let document: Value = serde_json::from_str(&text).map_err(|e| log_read(e.to_string()))?;
        let episodes = document
            .get(&self.config.episodes_key)
            .and_then(Value::as_array)
            .ok_or_else(|| log_read(format!("missing `{}` array", self.config.episodes_key)))?;

        let skip = episodes.len().saturating_sub(self.config.window);
        let values = episodes[skip..]
            .iter()
            .filter_map(|episode| match episode.get(&self.config.metric_field)? {
                Value::Array(entries) => Some(entries.len() as f64),
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
            .collect();
        Ok(values)
    }

    /// Mean metric over the trailing window, or 0 when there is nothing to
    /// average or the log cannot be read.
    pub fn score(&self, path: &Path) -> f64 {
        match self.read_last(path) {
            Ok(values) if values.is_empty() => {
                debug!(path = %path.display(), "no episodes recorded, scoring 0");
                0.0
            }
            Ok(values) => values.iter().sum::<f64>() / values.len() as f64,
            Err(e) => {
                warn!(error = %e, "unreadable trial log, scoring 0");
                0.0
            }
        }
    }
}
