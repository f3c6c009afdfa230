//! Matching tasks to contributor profiles.
//!
//! Tasks may carry three optional JSON documents:
//!
//! - `worker_filter`: `{"field": [threshold, "comparator"]}`, a hard
//!   requirement on numeric profile values
//! - `worker_pref`: `{"field": weight}`, a soft weighting of numeric profile
//!   values
//! - `user_pref`: `{"languages": [...], "locations": [...], "assign_user": [...]}`,
//!   list-overlap requirements
//!
//! A candidate is kept only if its filter and user preferences are
//! satisfiable; its score is the weighted profile sum plus one per matching
//! preference list.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator of a worker filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl Comparator {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Eq => value == threshold,
            Comparator::Ne => value != threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Gt => value > threshold,
        }
    }
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" | "less_than" => Ok(Comparator::Lt),
            "<=" | "less_than_equal" => Ok(Comparator::Le),
            "==" | "=" | "equal" => Ok(Comparator::Eq),
            "!=" | "not_equal" => Ok(Comparator::Ne),
            ">=" | "greater_than_equal" => Ok(Comparator::Ge),
            ">" | "greater_than" => Ok(Comparator::Gt),
            other => Err(format!("unknown comparator '{}'", other)),
        }
    }
}

/// Numeric value of a JSON number or numeric string.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// The parts of a contributor profile that preference matching reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Numeric profile attributes (accuracy, experience, ...).
    #[serde(default)]
    pub profile: HashMap<String, f64>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    /// Identifiers matched against `assign_user` (user id, email, name).
    #[serde(default)]
    pub identifiers: Vec<String>,
}

impl UserProfile {
    /// Builds a profile from a user's `info` document.
    ///
    /// Reads `metadata.profile` (object or JSON-encoded string) and the
    /// `metadata.languages` / `metadata.locations` lists; malformed parts
    /// are ignored.
    pub fn from_info(identifiers: Vec<String>, info: &Value) -> Self {
        let metadata = info.get("metadata").unwrap_or(&Value::Null);

        let profile_doc = match metadata.get("profile") {
            Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => Value::Null,
        };
        let profile = profile_doc
            .as_object()
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|(k, v)| as_number(v).map(|n| (k.clone(), n)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            profile,
            languages: metadata.get("languages").map(as_string_list).unwrap_or_default(),
            locations: metadata.get("locations").map(as_string_list).unwrap_or_default(),
            identifiers,
        }
    }
}

/// Hard numeric requirements a contributor must meet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerFilter {
    pub conditions: Vec<(String, f64, Comparator)>,
}

impl WorkerFilter {
    /// Parses `{"field": [threshold, "comparator"]}`.
    ///
    /// A malformed condition can never be satisfied and is kept as such.
    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_object()?;
        let conditions = fields
            .iter()
            .map(|(field, spec)| {
                let parsed = spec.as_array().and_then(|pair| {
                    let threshold = as_number(pair.first()?)?;
                    let comparator = pair.get(1)?.as_str()?.parse().ok()?;
                    Some((threshold, comparator))
                });
                match parsed {
                    Some((threshold, comparator)) => (field.clone(), threshold, comparator),
                    // NaN fails every comparison, including !=
                    None => (field.clone(), f64::NAN, Comparator::Eq),
                }
            })
            .collect();
        Some(Self { conditions })
    }

    pub fn is_satisfied_by(&self, profile: &UserProfile) -> bool {
        self.conditions.iter().all(|(field, threshold, comparator)| {
            profile
                .profile
                .get(field)
                .is_some_and(|value| !threshold.is_nan() && comparator.compare(*value, *threshold))
        })
    }
}

/// Soft weighting of numeric profile values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerPreference {
    pub weights: HashMap<String, f64>,
}

impl WorkerPreference {
    /// Parses `{"field": weight}`, ignoring non-numeric weights.
    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_object()?;
        Some(Self {
            weights: fields
                .iter()
                .filter_map(|(k, v)| as_number(v).map(|w| (k.clone(), w)))
                .collect(),
        })
    }

    /// Σ weight × profile value over fields present in the profile.
    pub fn score(&self, profile: &UserProfile) -> f64 {
        self.weights
            .iter()
            .filter_map(|(field, weight)| profile.profile.get(field).map(|v| weight * v))
            .sum()
    }
}

/// List-overlap requirements of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPref {
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub assign_user: Vec<String>,
}

impl UserPref {
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object()?;
        Some(Self {
            languages: value.get("languages").map(as_string_list).unwrap_or_default(),
            locations: value.get("locations").map(as_string_list).unwrap_or_default(),
            assign_user: value.get("assign_user").map(as_string_list).unwrap_or_default(),
        })
    }

    /// Returns the match score, or `None` when a non-empty list has no overlap.
    pub fn score(&self, profile: &UserProfile) -> Option<f64> {
        let lists = [
            (&self.languages, &profile.languages),
            (&self.locations, &profile.locations),
            (&self.assign_user, &profile.identifiers),
        ];

        let mut score = 0.0;
        for (wanted, have) in lists {
            if wanted.is_empty() {
                continue;
            }
            if !wanted.iter().any(|w| have.iter().any(|h| h.eq_ignore_ascii_case(w))) {
                return None;
            }
            score += 1.0;
        }
        Some(score)
    }
}

/// Scores a candidate against a profile, `None` when it must be dropped.
pub fn preference_score(
    worker_filter: Option<&Value>,
    worker_pref: Option<&Value>,
    user_pref: Option<&Value>,
    profile: &UserProfile,
) -> Option<f64> {
    if let Some(filter) = worker_filter.and_then(WorkerFilter::from_value) {
        if !filter.is_satisfied_by(profile) {
            return None;
        }
    }

    let mut score = 0.0;
    if let Some(pref) = user_pref.and_then(UserPref::from_value) {
        score += pref.score(profile)?;
    }
    if let Some(pref) = worker_pref.and_then(WorkerPreference::from_value) {
        score += pref.score(profile);
    }
    Some(score)
}
