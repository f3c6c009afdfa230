//! Gold task ordering and saved-position ranking.

use std::fmt;
use std::str::FromStr;

use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::store::ProjectSettings;

/// Gold task probability used when a project enables gold without setting one.
pub const DEFAULT_GOLD_PROBABILITY: f64 = 0.1;

/// Where gold (calibration) tasks go in the candidate order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoldMode {
    /// Gold tasks are ordered ahead of regular tasks.
    GoldFirst,
    /// Gold tasks are ordered after regular tasks.
    GoldLast,
    /// Only gold tasks are candidates.
    GoldOnly,
    /// Gold tasks are never candidates.
    NoGold,
}

impl GoldMode {
    /// Picks the gold mode for one scheduling call.
    pub fn select<R: rand::Rng + ?Sized>(
        gold_only: bool,
        settings: &ProjectSettings,
        rng: &mut R,
    ) -> Self {
        if gold_only {
            return GoldMode::GoldOnly;
        }
        match settings.enable_gold {
            Some(false) => GoldMode::NoGold,
            Some(true) => {
                let probability = settings
                    .gold_task_probability
                    .unwrap_or(DEFAULT_GOLD_PROBABILITY)
                    .clamp(0.0, 1.0);
                if rng.random::<f64>() < probability {
                    GoldMode::GoldFirst
                } else {
                    GoldMode::GoldLast
                }
            }
            None => GoldMode::GoldLast,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GoldMode::GoldFirst => "gold_first",
            GoldMode::GoldLast => "gold_last",
            GoldMode::GoldOnly => "gold_only",
            GoldMode::NoGold => "no_gold",
        }
    }

    /// Whether gold tasks may appear at all.
    pub fn allows_gold(&self) -> bool {
        !matches!(self, GoldMode::NoGold)
    }

    /// Whether regular tasks may appear at all.
    pub fn allows_regular(&self) -> bool {
        !matches!(self, GoldMode::GoldOnly)
    }
}

impl fmt::Display for GoldMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where saved-but-unsubmitted tasks are ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavedTaskPosition {
    /// Saved tasks come before every other candidate, oldest save first.
    First,
    /// Saved tasks come after every other candidate, newest save first.
    Last,
}

impl SavedTaskPosition {
    /// Ranking score of a task saved at `saved_at`; unsaved tasks score 0.
    pub fn score(&self, saved_at: f64) -> f64 {
        if saved_at <= 0.0 {
            return 0.0;
        }
        match self {
            SavedTaskPosition::First => 1.0 / saved_at,
            SavedTaskPosition::Last => -1.0 / saved_at,
        }
    }
}

impl FromStr for SavedTaskPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(SavedTaskPosition::First),
            "last" => Ok(SavedTaskPosition::Last),
            other => Err(format!("unknown saved task position '{}'", other)),
        }
    }
}
