//! PostgreSQL adapter for the relational collaborators.
//!
//! Reads the `project`, `task`, `task_run` and `"user"` tables. Candidate
//! queries are assembled by [`build_candidate_sql`], a pure function, so the
//! generated SQL can be inspected without a database.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use super::types::{parse_timeout, CandidateQuery, CandidateRow, OrderColumn, Project, Task, TaskState};
use super::{ProjectStore, TaskStore, UserStore};
use crate::error::RepositoryError;
use crate::sched::{GoldMode, UserProfile};

/// A bind parameter of a generated query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int(i64),
    Text(String),
    IntArray(Vec<i64>),
}

/// Whether a candidate query selects rows or counts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSqlMode {
    Select,
    Count,
}

/// Generated SQL text with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSql {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl CandidateSql {
    fn push(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }
}

/// Builds the candidate query for `query`.
///
/// Eligible tasks belong to the project, are not completed, have an open
/// redundancy slot (gold tasks always do), were not answered by the
/// requester, and pass the gold mode and reservation filter.
pub fn build_candidate_sql(query: &CandidateQuery, mode: CandidateSqlMode) -> CandidateSql {
    let mut out = CandidateSql {
        sql: String::new(),
        params: Vec::new(),
    };
    let project = out.push(SqlParam::Int(query.project_id));

    let select = match mode {
        CandidateSqlMode::Select => {
            "SELECT task.id::bigint AS id, task.n_answers::int AS n_answers, \
             COALESCE(task.calibration, 0)::int AS calibration, task.worker_filter, task.worker_pref, task.user_pref, \
             COALESCE(runs.n, 0) AS taskrun_count, project.info->'timeout' AS project_timeout"
        }
        CandidateSqlMode::Count => "SELECT COUNT(*) AS n",
    };

    let mut sql = format!(
        "{select} FROM task \
         JOIN project ON project.id = task.project_id \
         LEFT JOIN (SELECT task_id, COUNT(*) AS n FROM task_run WHERE project_id = {project} \
         GROUP BY task_id) runs ON runs.task_id = task.id \
         WHERE task.project_id = {project} \
         AND task.state != 'completed' \
         AND (COALESCE(task.calibration, 0) = 1 OR COALESCE(runs.n, 0) < task.n_answers)"
    );

    let requester = &query.requester;
    let answered = if let Some(user_id) = requester.user_id {
        Some(("user_id", out.push(SqlParam::Int(user_id))))
    } else if let Some(uid) = requester.external_uid.clone().filter(|u| !u.is_empty()) {
        Some(("external_uid", out.push(SqlParam::Text(uid))))
    } else {
        requester
            .user_ip
            .clone()
            .filter(|ip| !ip.is_empty())
            .map(|ip| ("user_ip", out.push(SqlParam::Text(ip))))
    };
    if let Some((column, param)) = answered {
        sql.push_str(&format!(
            " AND NOT EXISTS (SELECT 1 FROM task_run tr WHERE tr.task_id = task.id AND tr.{} = {})",
            column, param
        ));
    }

    match query.gold {
        GoldMode::GoldOnly => sql.push_str(" AND COALESCE(task.calibration, 0) = 1"),
        GoldMode::NoGold => sql.push_str(" AND COALESCE(task.calibration, 0) = 0"),
        GoldMode::GoldFirst | GoldMode::GoldLast => {}
    }

    sql.push_str(&query.reservation.to_sql());

    if mode == CandidateSqlMode::Count {
        out.sql = sql;
        return out;
    }

    let mut order = Vec::new();
    if !query.pinned.is_empty() {
        let pinned = out.push(SqlParam::IntArray(query.pinned.clone()));
        order.push(format!("(task.id = ANY({})) DESC", pinned));
    }
    match query.gold {
        GoldMode::GoldFirst => order.push("calibration DESC".to_string()),
        GoldMode::GoldLast => order.push("calibration ASC".to_string()),
        GoldMode::GoldOnly | GoldMode::NoGold => {}
    }
    let direction = if query.order.desc { "DESC" } else { "ASC" };
    match query.order.column {
        OrderColumn::Priority => {
            order.push(format!("task.priority_0 {}", direction));
            order.push(if query.rand_within_priority {
                "random()".to_string()
            } else {
                "task.id ASC".to_string()
            });
        }
        OrderColumn::Id => order.push(format!("task.id {}", direction)),
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));

    let limit = out.push(SqlParam::Int(query.limit as i64));
    let offset = out.push(SqlParam::Int(query.offset as i64));
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

    out.sql = sql;
    out
}

/// PostgreSQL-backed task, project and user store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to the database.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn bind_all<'q>(
        mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        params: &'q [SqlParam],
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        for param in params {
            query = match param {
                SqlParam::Int(v) => query.bind(*v),
                SqlParam::Text(v) => query.bind(v.as_str()),
                SqlParam::IntArray(v) => query.bind(v.as_slice()),
            };
        }
        query
    }
}

const TASK_COLUMNS: &str = "id::bigint AS id, project_id::bigint AS project_id, state, \
     n_answers::int AS n_answers, COALESCE(calibration, 0)::int AS calibration, \
     COALESCE(priority_0, 0)::float8 AS priority_0, info, worker_filter, worker_pref, user_pref";

fn task_from_row(row: &PgRow) -> Task {
    let state: String = row.get("state");
    Task {
        id: row.get("id"),
        project_id: row.get("project_id"),
        state: state.parse().unwrap_or(TaskState::Ongoing),
        n_answers: row.get::<i32, _>("n_answers") as i64,
        calibration: row.get::<i32, _>("calibration") != 0,
        priority_0: row.get("priority_0"),
        info: row.get::<Option<Value>, _>("info").unwrap_or(Value::Null),
        worker_filter: row.get("worker_filter"),
        worker_pref: row.get("worker_pref"),
        user_pref: row.get("user_pref"),
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn get_task(&self, task_id: i64) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM task WHERE id = $1", TASK_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(task_from_row))
    }

    async fn get_task_by(
        &self,
        project_id: i64,
        task_id: i64,
    ) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM task WHERE id = $1 AND project_id = $2",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(task_from_row))
    }

    async fn count_task_runs(&self, task_id: i64) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM task_run WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn get_candidate_tasks(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<CandidateRow>, RepositoryError> {
        let built = build_candidate_sql(query, CandidateSqlMode::Select);
        let rows = Self::bind_all(sqlx::query(&built.sql), &built.params)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| CandidateRow {
                task_id: row.get("id"),
                taskrun_count: row.get("taskrun_count"),
                n_answers: row.get::<i32, _>("n_answers") as i64,
                is_gold: row.get::<i32, _>("calibration") != 0,
                worker_filter: row.get("worker_filter"),
                worker_pref: row.get("worker_pref"),
                user_pref: row.get("user_pref"),
                timeout: row
                    .get::<Option<Value>, _>("project_timeout")
                    .as_ref()
                    .and_then(parse_timeout),
            })
            .collect())
    }

    async fn count_candidate_tasks(&self, query: &CandidateQuery) -> Result<usize, RepositoryError> {
        let built = build_candidate_sql(query, CandidateSqlMode::Count);
        let row = Self::bind_all(sqlx::query(&built.sql), &built.params)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n").max(0) as usize)
    }
}

#[async_trait]
impl ProjectStore for PgStore {
    async fn get_project(&self, project_id: i64) -> Result<Option<Project>, RepositoryError> {
        let row = sqlx::query("SELECT id::bigint AS id, info FROM project WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let info: Option<Value> = row.get("info");
            Project::new(row.get("id"), info.unwrap_or(Value::Null))
        }))
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn get_user_profile(&self, user_id: i64) -> Result<Option<UserProfile>, RepositoryError> {
        let row = sqlx::query(r#"SELECT id, name, email_addr, info FROM "user" WHERE id = $1"#)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let mut identifiers = vec![user_id.to_string()];
            identifiers.extend(row.get::<Option<String>, _>("name"));
            identifiers.extend(row.get::<Option<String>, _>("email_addr"));
            let info: Option<Value> = row.get("info");
            UserProfile::from_info(identifiers, &info.unwrap_or(Value::Null))
        }))
    }
}
