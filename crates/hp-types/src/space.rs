//! Search space definitions.
//!
//! A [`SearchSpace`] is an ordered list of named dimensions. Values handed to
//! or loaded from the outside world go through [`ParameterDef::coerce`] or
//! [`ParameterDef::parse`] so every stored value has the dimension's kind and
//! lies inside its bounds.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::candidate::Candidate;
use crate::errors::SpaceError;

/// Characters that would make the canonical trial identifier ambiguous or
/// unusable as a filename stem.
pub const RESERVED_CHARS: &[char] = &[',', '=', '/', '\\', '\0'];

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name (e.g. "reproduction_reward").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Json(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(serde_json::Value::String(s)) => f.write_str(s),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

fn json_matches(choice: &serde_json::Value, value: &serde_json::Value) -> bool {
    match (choice.as_f64(), value.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => choice == value,
    }
}

impl ParameterDef {
    fn validate(&self) -> Result<(), SpaceError> {
        if self.name.is_empty()
            || self.name.contains(RESERVED_CHARS)
            || self.name.chars().any(char::is_whitespace)
        {
            return Err(SpaceError::InvalidName {
                name: self.name.clone(),
                message: "names must be non-empty, without whitespace or , = / \\".to_string(),
            });
        }

        match &self.kind {
            ParameterKind::FloatRange { low, high } => {
                if !(high - low).is_finite() || low > high {
                    return Err(self.invalid_range(*low, *high));
                }
            }
            ParameterKind::LogUniform { low, high } => {
                if !low.is_finite() || !high.is_finite() || *low <= 0.0 || low > high {
                    return Err(self.invalid_range(*low, *high));
                }
            }
            ParameterKind::IntRange { low, high } => {
                if low > high {
                    return Err(self.invalid_range(*low as f64, *high as f64));
                }
            }
            ParameterKind::Choice { values } => {
                if values.is_empty() {
                    return Err(SpaceError::EmptyChoice {
                        name: self.name.clone(),
                    });
                }
                let mut seen = HashSet::with_capacity(values.len());
                for value in values {
                    let rendered = ParameterValue::Json(value.clone()).to_string();
                    if rendered.is_empty() || rendered.contains(RESERVED_CHARS) {
                        return Err(SpaceError::ReservedCharacter {
                            name: self.name.clone(),
                            value: rendered,
                        });
                    }
                    if !seen.insert(rendered.clone()) {
                        return Err(SpaceError::DuplicateChoice {
                            name: self.name.clone(),
                            value: rendered,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn invalid_range(&self, low: f64, high: f64) -> SpaceError {
        SpaceError::InvalidRange {
            name: self.name.clone(),
            low,
            high,
        }
    }

    fn out_of_bounds(&self, value: impl std::fmt::Display) -> SpaceError {
        SpaceError::OutOfBounds {
            name: self.name.clone(),
            value: value.to_string(),
        }
    }

    fn kind_mismatch(&self, value: impl std::fmt::Display) -> SpaceError {
        SpaceError::KindMismatch {
            name: self.name.clone(),
            value: value.to_string(),
        }
    }

    /// Check `value` against this dimension and convert it to the
    /// dimension's native representation (e.g. `Float(3.0)` on an integer
    /// dimension becomes `Int(3)`).
    pub fn coerce(&self, value: &ParameterValue) -> Result<ParameterValue, SpaceError> {
        match &self.kind {
            ParameterKind::FloatRange { low, high } | ParameterKind::LogUniform { low, high } => {
                let v = value.as_f64().ok_or_else(|| self.kind_mismatch(value))?;
                if !v.is_finite() || v < *low || v > *high {
                    return Err(self.out_of_bounds(value));
                }
                Ok(ParameterValue::Float(v))
            }
            ParameterKind::IntRange { low, high } => {
                let v = match value {
                    ParameterValue::Int(v) => *v,
                    other => {
                        let f = other.as_f64().ok_or_else(|| self.kind_mismatch(other))?;
                        if !f.is_finite() || f.fract() != 0.0 {
                            return Err(self.kind_mismatch(other));
                        }
                        f as i64
                    }
                };
                if v < *low || v > *high {
                    return Err(self.out_of_bounds(value));
                }
                Ok(ParameterValue::Int(v))
            }
            ParameterKind::Choice { values } => {
                let json = value.to_json();
                values
                    .iter()
                    .find(|choice| json_matches(choice, &json))
                    .map(|choice| ParameterValue::Json(choice.clone()))
                    .ok_or_else(|| self.out_of_bounds(value))
            }
        }
    }

    /// Parse the textual form written by [`ParameterValue`]'s `Display`.
    pub fn parse(&self, raw: &str) -> Result<ParameterValue, SpaceError> {
        let raw = raw.trim();
        match &self.kind {
            ParameterKind::FloatRange { .. }
            | ParameterKind::LogUniform { .. }
            | ParameterKind::IntRange { .. } => {
                let value = match raw.parse::<i64>() {
                    Ok(v) => ParameterValue::Int(v),
                    Err(_) => ParameterValue::Float(
                        raw.parse::<f64>().map_err(|_| self.kind_mismatch(raw))?,
                    ),
                };
                self.coerce(&value)
            }
            ParameterKind::Choice { values } => values
                .iter()
                .find(|choice| ParameterValue::Json((*choice).clone()).to_string() == raw)
                .map(|choice| ParameterValue::Json(choice.clone()))
                .ok_or_else(|| self.out_of_bounds(raw)),
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Dimension names in declared order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    /// Reject empty spaces, duplicate names and malformed ranges.
    pub fn validate(&self) -> Result<(), SpaceError> {
        if self.parameters.is_empty() {
            return Err(SpaceError::Empty);
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            param.validate()?;
            if !seen.insert(param.name.as_str()) {
                return Err(SpaceError::DuplicateName {
                    name: param.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Check that `candidate` assigns an in-bounds value to exactly the
    /// dimensions of this space.
    pub fn validate_candidate(&self, candidate: &Candidate) -> Result<(), SpaceError> {
        for (name, _) in candidate.iter() {
            if self.get(name).is_none() {
                return Err(SpaceError::UnknownParameter { name: name.clone() });
            }
        }
        for param in &self.parameters {
            let value = candidate
                .get(&param.name)
                .ok_or_else(|| SpaceError::MissingValue {
                    name: param.name.clone(),
                })?;
            param.coerce(value)?;
        }
        Ok(())
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}
