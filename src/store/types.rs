//! Domain records read from the relational store.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchedulerError;
use crate::identity::Requester;
use crate::reservation::CategoryFilter;
use crate::sched::{GoldMode, SchedulerKind};

/// Typed view of the scheduling-related keys of `project.info`.
///
/// Parsed once at the boundary. Unknown keys are ignored and malformed
/// values fall back to "unset".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Configured scheduler name (`sched`).
    pub sched: Option<String>,
    /// Lock timeout in seconds (`timeout`).
    pub timeout: Option<u64>,
    /// Reservation fields (`reserve_tasks.category`).
    pub reserve_category: Vec<String>,
    /// Gold task switch (`enable_gold`).
    pub enable_gold: Option<bool>,
    /// Probability of ordering gold tasks first (`gold_task_probability`).
    pub gold_task_probability: Option<f64>,
}

impl ProjectSettings {
    pub fn from_info(info: &Value) -> Self {
        let sched = info
            .get("sched")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string);

        let reserve_category = info
            .get("reserve_tasks")
            .and_then(|r| r.get("category"))
            .and_then(Value::as_array)
            .map(|fields| {
                let mut fields: Vec<String> = fields
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect();
                fields.sort();
                fields.dedup();
                fields
            })
            .unwrap_or_default();

        let gold_task_probability = info
            .get("gold_task_probability")
            .and_then(Value::as_f64)
            .filter(|p| (0.0..=1.0).contains(p));

        Self {
            sched,
            timeout: info.get("timeout").and_then(parse_timeout),
            reserve_category,
            enable_gold: info.get("enable_gold").and_then(Value::as_bool),
            gold_task_probability,
        }
    }

    pub fn scheduler_kind(&self) -> SchedulerKind {
        SchedulerKind::from_name(self.sched.as_deref())
    }

    /// Configured lock timeout, or `default`.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.map(Duration::from_secs).unwrap_or(default)
    }
}

/// Positive whole seconds from a JSON number or numeric string.
pub(crate) fn parse_timeout(value: &Value) -> Option<u64> {
    let secs = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    (secs > 0).then_some(secs)
}

/// A project and its parsed settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub id: i64,
    pub info: Value,
    #[serde(skip)]
    pub settings: ProjectSettings,
}

impl Project {
    pub fn new(id: i64, info: Value) -> Self {
        let settings = ProjectSettings::from_info(&info);
        Self { id, info, settings }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Ongoing,
    Completed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ongoing => "ongoing",
            TaskState::Completed => "completed",
        }
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(TaskState::Ongoing),
            "completed" => Ok(TaskState::Completed),
            other => Err(format!("unknown task state '{}'", other)),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task as handed to a contributor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub state: TaskState,
    /// Redundancy: task runs needed to complete the task.
    pub n_answers: i64,
    /// Gold (calibration) task with unbounded redundancy.
    pub calibration: bool,
    pub priority_0: f64,
    pub info: Value,
    pub worker_filter: Option<Value>,
    pub worker_pref: Option<Value>,
    pub user_pref: Option<Value>,
}

impl Task {
    /// An ongoing, non-gold task needing one answer.
    pub fn new(id: i64, project_id: i64) -> Self {
        Self {
            id,
            project_id,
            state: TaskState::Ongoing,
            n_answers: 1,
            calibration: false,
            priority_0: 0.0,
            info: Value::Object(Default::default()),
            worker_filter: None,
            worker_pref: None,
            user_pref: None,
        }
    }

    pub fn with_n_answers(mut self, n_answers: i64) -> Self {
        self.n_answers = n_answers;
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority_0 = priority;
        self
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = info;
        self
    }

    pub fn with_worker_filter(mut self, filter: Value) -> Self {
        self.worker_filter = Some(filter);
        self
    }

    pub fn with_user_pref(mut self, pref: Value) -> Self {
        self.user_pref = Some(pref);
        self
    }

    /// Marks the task as a gold (calibration) task.
    pub fn gold(mut self) -> Self {
        self.calibration = true;
        self
    }

    pub fn is_gold(&self) -> bool {
        self.calibration
    }
}

/// One row of the candidate query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRow {
    pub task_id: i64,
    /// Task runs submitted so far.
    pub taskrun_count: i64,
    pub n_answers: i64,
    pub is_gold: bool,
    pub worker_filter: Option<Value>,
    pub worker_pref: Option<Value>,
    pub user_pref: Option<Value>,
    /// Project-level lock timeout override in seconds.
    pub timeout: Option<u64>,
}

impl CandidateRow {
    /// Open redundancy slots; `None` means unbounded (gold tasks).
    pub fn remaining_slots(&self) -> Option<usize> {
        if self.is_gold {
            return None;
        }
        Some((self.n_answers - self.taskrun_count).max(0) as usize)
    }
}

/// Column a candidate query orders by after gold placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderColumn {
    #[default]
    Priority,
    Id,
}

/// Ordering requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOrder {
    pub column: OrderColumn,
    pub desc: bool,
}

impl Default for TaskOrder {
    fn default() -> Self {
        Self {
            column: OrderColumn::Priority,
            desc: true,
        }
    }
}

impl TaskOrder {
    /// Resolves an `orderby` column name; only whitelisted columns are accepted.
    pub fn parse(orderby: Option<&str>, desc: bool) -> Result<Self, SchedulerError> {
        let column = match orderby.map(str::trim) {
            None | Some("") | Some("priority_0") | Some("priority") => OrderColumn::Priority,
            Some("id") => OrderColumn::Id,
            Some(other) => {
                return Err(SchedulerError::BadRequest(format!(
                    "cannot order tasks by '{}'",
                    other
                )))
            }
        };
        Ok(Self { column, desc })
    }
}

/// Parameters of the candidate query.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub project_id: i64,
    /// Tasks this requester already answered are excluded.
    pub requester: Requester,
    /// Category reservation filter.
    pub reservation: CategoryFilter,
    pub gold: GoldMode,
    pub order: TaskOrder,
    /// Shuffle tasks of equal priority instead of ordering by id.
    pub rand_within_priority: bool,
    pub limit: usize,
    pub offset: usize,
    /// Task ids ordered ahead of everything else so the limit cannot cut them.
    pub pinned: Vec<i64>,
}

impl CandidateQuery {
    pub fn new(project_id: i64, requester: Requester) -> Self {
        Self {
            project_id,
            requester,
            reservation: CategoryFilter::default(),
            gold: GoldMode::GoldLast,
            order: TaskOrder::default(),
            rand_within_priority: false,
            limit: 1,
            offset: 0,
            pinned: Vec::new(),
        }
    }
}
