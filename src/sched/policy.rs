//! Scheduling policies.
//!
//! Each policy is a [`TaskSelector`]: it decides how large a candidate batch
//! to fetch, whether reservations and the contributor profile are involved,
//! and how fetched candidates are filtered and ranked. Everything else
//! (fast paths, candidate fetch, the lock attempt loop) is shared and lives
//! in the driver.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::gold::SavedTaskPosition;
use super::preferences::{preference_score, UserProfile};
use crate::config::SchedulerConfig;
use crate::store::CandidateRow;

/// The configured scheduler of a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// Priority order, one lock per redundancy slot.
    #[default]
    #[serde(rename = "locked_scheduler")]
    Locked,
    /// Candidates filtered and ranked by the contributor profile.
    #[serde(rename = "user_pref_scheduler")]
    UserPref,
    /// Preference scheduling plus category reservations.
    #[serde(rename = "task_queue_scheduler")]
    TaskQueue,
}

impl SchedulerKind {
    /// Resolves a configured scheduler name; unknown or missing names mean `Locked`.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            Some("user_pref_scheduler") => SchedulerKind::UserPref,
            Some("task_queue_scheduler") => SchedulerKind::TaskQueue,
            _ => SchedulerKind::Locked,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Locked => "locked_scheduler",
            SchedulerKind::UserPref => "user_pref_scheduler",
            SchedulerKind::TaskQueue => "task_queue_scheduler",
        }
    }

    /// The selector implementing this policy.
    pub fn selector(&self) -> &'static dyn TaskSelector {
        match self {
            SchedulerKind::Locked => &LockedSelector,
            SchedulerKind::UserPref => &UserPrefSelector,
            SchedulerKind::TaskQueue => &TaskQueueSelector,
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(Some(s)))
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request inputs to ranking.
#[derive(Debug, Clone, Default)]
pub struct RankContext {
    /// Contributor profile, loaded when the selector needs one.
    pub profile: Option<UserProfile>,
    /// Saved partial answers: task id to save timestamp.
    pub saved: BTreeMap<i64, f64>,
    pub saved_position: Option<SavedTaskPosition>,
}

impl RankContext {
    fn saved_position_active(&self) -> Option<SavedTaskPosition> {
        self.saved_position.filter(|_| !self.saved.is_empty())
    }
}

/// A scheduling policy.
pub trait TaskSelector: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Candidate batch size before the saved-answer allowance.
    fn batch_size(&self, active_users: usize, config: &SchedulerConfig) -> usize;

    /// Whether the category reservation filter applies.
    fn uses_reservations(&self) -> bool {
        false
    }

    /// Whether ranking reads the contributor profile.
    fn needs_profile(&self) -> bool {
        false
    }

    /// Filters and orders fetched candidates, best first.
    fn rank(&self, candidates: Vec<CandidateRow>, ctx: &RankContext) -> Vec<CandidateRow>;
}

/// Stable sort by descending score.
fn sort_by_score(mut scored: Vec<(f64, CandidateRow)>) -> Vec<CandidateRow> {
    scored.sort_by_key(|(score, _)| Reverse(OrderedFloat(*score)));
    scored.into_iter().map(|(_, row)| row).collect()
}

/// Saved-position scores, which replace every other ranking signal.
fn rank_by_saved_position(
    candidates: Vec<CandidateRow>,
    position: SavedTaskPosition,
    saved: &BTreeMap<i64, f64>,
) -> Vec<CandidateRow> {
    let scored = candidates
        .into_iter()
        .map(|row| {
            let score = saved
                .get(&row.task_id)
                .map_or(0.0, |saved_at| position.score(*saved_at));
            (score, row)
        })
        .collect();
    sort_by_score(scored)
}

/// Preference ranking shared by the profile-aware policies.
fn rank_by_preference(candidates: Vec<CandidateRow>, ctx: &RankContext) -> Vec<CandidateRow> {
    let profile = ctx.profile.clone().unwrap_or_default();

    if let Some(position) = ctx.saved_position_active() {
        // Saved tasks were already presented once, so they skip the filter
        let kept = candidates
            .into_iter()
            .filter(|row| {
                ctx.saved.contains_key(&row.task_id)
                    || preference_score(
                        row.worker_filter.as_ref(),
                        row.worker_pref.as_ref(),
                        row.user_pref.as_ref(),
                        &profile,
                    )
                    .is_some()
            })
            .collect();
        return rank_by_saved_position(kept, position, &ctx.saved);
    }

    let scored = candidates
        .into_iter()
        .filter_map(|row| {
            preference_score(
                row.worker_filter.as_ref(),
                row.worker_pref.as_ref(),
                row.user_pref.as_ref(),
                &profile,
            )
            .map(|score| (score, row))
        })
        .collect();
    sort_by_score(scored)
}

fn preference_batch_size(active_users: usize, config: &SchedulerConfig) -> usize {
    config
        .max_preference_batch
        .max(active_users + config.batch_slack)
}

/// Plain priority scheduling.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockedSelector;

impl TaskSelector for LockedSelector {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Locked
    }

    fn batch_size(&self, active_users: usize, config: &SchedulerConfig) -> usize {
        active_users + config.batch_slack
    }

    fn rank(&self, candidates: Vec<CandidateRow>, ctx: &RankContext) -> Vec<CandidateRow> {
        match ctx.saved_position_active() {
            Some(position) => rank_by_saved_position(candidates, position, &ctx.saved),
            // Keep the query's own ORDER BY
            None => candidates,
        }
    }
}

/// Profile-matched scheduling.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserPrefSelector;

impl TaskSelector for UserPrefSelector {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::UserPref
    }

    fn batch_size(&self, active_users: usize, config: &SchedulerConfig) -> usize {
        preference_batch_size(active_users, config)
    }

    fn needs_profile(&self) -> bool {
        true
    }

    fn rank(&self, candidates: Vec<CandidateRow>, ctx: &RankContext) -> Vec<CandidateRow> {
        rank_by_preference(candidates, ctx)
    }
}

/// Profile-matched scheduling steered by category reservations.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskQueueSelector;

impl TaskSelector for TaskQueueSelector {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::TaskQueue
    }

    fn batch_size(&self, active_users: usize, config: &SchedulerConfig) -> usize {
        preference_batch_size(active_users, config)
    }

    fn uses_reservations(&self) -> bool {
        true
    }

    fn needs_profile(&self) -> bool {
        true
    }

    fn rank(&self, candidates: Vec<CandidateRow>, ctx: &RankContext) -> Vec<CandidateRow> {
        rank_by_preference(candidates, ctx)
    }
}
