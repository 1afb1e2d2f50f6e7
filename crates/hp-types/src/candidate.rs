//! Candidates, their canonical identifiers, and observations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::space::ParameterValue;

/// Separator between `name=value` pairs in a [`TrialId`].
pub const ID_SEPARATOR: char = ',';

/// One proposed assignment of values to every search dimension.
///
/// Entries are kept sorted by name, which makes iteration order and the
/// derived [`TrialId`] independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(BTreeMap<String, ParameterValue>);

impl Candidate {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn identifier(&self) -> TrialId {
        TrialId::from_candidate(self)
    }
}

impl FromIterator<(String, ParameterValue)> for Candidate {
    fn from_iter<I: IntoIterator<Item = (String, ParameterValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}

/// Canonical run identifier for a candidate: `name=value` pairs sorted by
/// name and joined with [`ID_SEPARATOR`].
///
/// Floats render with Rust's shortest round-trip formatting, so two distinct
/// values never render alike. Names and categorical values are validated
/// against the reserved characters in [`crate::space::RESERVED_CHARS`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialId(String);

impl TrialId {
    pub fn from_candidate(candidate: &Candidate) -> Self {
        let mut id = String::new();
        for (i, (name, value)) in candidate.iter().enumerate() {
            if i > 0 {
                id.push(ID_SEPARATOR);
            }
            id.push_str(name);
            id.push('=');
            id.push_str(&value.to_string());
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (candidate, score) pair fed back into the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub candidate: Candidate,
    pub score: f64,
}

impl Observation {
    pub fn new(candidate: Candidate, score: f64) -> Self {
        Self { candidate, score }
    }
}
