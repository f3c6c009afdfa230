//! Key naming for everything the core writes to the shared store.
//!
//! All keys live under a configurable namespace so several deployments can
//! share one Redis. Reservation keys embed their full identity
//! (`project`, `category`, `user`, `task`) so they can be enumerated with a
//! glob pattern and parsed back without a second lookup.

/// A parsed reservation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReservationKey {
    pub project_id: i64,
    /// Encoded category, `field1:value1:field2:value2...`.
    pub category: String,
    pub user_id: i64,
    pub task_id: i64,
}

/// Builds and parses keys under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash of holders currently locking a task.
    pub fn task_users_key(&self, task_id: i64) -> String {
        format!("{}:task:users:{}", self.prefix, task_id)
    }

    /// Hash of tasks currently locked by a holder.
    pub fn user_tasks_key(&self, holder_id: &str) -> String {
        format!("{}:user:tasks:{}", self.prefix, holder_id)
    }

    /// Scalar reverse index from a task to its project.
    pub fn task_project_key(&self, task_id: i64) -> String {
        format!("{}:task:project:{}", self.prefix, task_id)
    }

    /// Hash of active users in a project.
    pub fn active_users_key(&self, project_id: i64) -> String {
        format!("{}:project:active_users:{}", self.prefix, project_id)
    }

    /// Contribution guard "requested" stamp.
    pub fn requested_stamp_key(&self, task_id: i64, holder_id: &str) -> String {
        format!(
            "{}:guard:requested:user:{}:task:{}",
            self.prefix, holder_id, task_id
        )
    }

    /// Contribution guard "presented" stamp.
    pub fn presented_stamp_key(&self, task_id: i64, holder_id: &str) -> String {
        format!(
            "{}:guard:presented:user:{}:task:{}",
            self.prefix, holder_id, task_id
        )
    }

    /// Hash of saved partial answers for one user in one project.
    pub fn partial_answers_key(&self, project_id: i64, holder_id: &str) -> String {
        format!(
            "{}:partial_answers:project:{}:user:{}",
            self.prefix, project_id, holder_id
        )
    }

    fn reservation_root(&self) -> String {
        format!("{}:reserve_task:project:", self.prefix)
    }

    /// Key of a single reservation.
    pub fn reservation_key(&self, key: &ReservationKey) -> String {
        format!(
            "{}{}:category:{}:user:{}:task:{}",
            self.reservation_root(),
            key.project_id,
            key.category,
            key.user_id,
            key.task_id
        )
    }

    /// Glob pattern over reservation keys; `None` parts match anything.
    pub fn reservation_pattern(
        &self,
        project_id: i64,
        category: Option<&str>,
        user_id: Option<i64>,
        task_id: Option<i64>,
    ) -> String {
        let user = user_id.map_or_else(|| "*".to_string(), |u| u.to_string());
        let task = task_id.map_or_else(|| "*".to_string(), |t| t.to_string());
        format!(
            "{}{}:category:{}:user:{}:task:{}",
            self.reservation_root(),
            project_id,
            category.unwrap_or("*"),
            user,
            task
        )
    }

    /// Parses a reservation key produced by [`KeySpace::reservation_key`].
    pub fn parse_reservation_key(&self, key: &str) -> Option<ReservationKey> {
        let rest = key.strip_prefix(&self.reservation_root())?;
        let (project, rest) = rest.split_once(":category:")?;
        let (rest, task) = rest.rsplit_once(":task:")?;
        let (category, user) = rest.rsplit_once(":user:")?;

        Some(ReservationKey {
            project_id: project.parse().ok()?,
            category: category.to_string(),
            user_id: user.parse().ok()?,
            task_id: task.parse().ok()?,
        })
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("crowdsched")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys() {
        let keys = KeySpace::new("cs");
        assert_eq!(keys.task_users_key(12), "cs:task:users:12");
        assert_eq!(keys.user_tasks_key("7"), "cs:user:tasks:7");
        assert_eq!(keys.task_project_key(12), "cs:task:project:12");
        assert_eq!(keys.active_users_key(3), "cs:project:active_users:3");
    }

    #[test]
    fn test_reservation_key_round_trip() {
        let keys = KeySpace::new("cs");
        let reservation = ReservationKey {
            project_id: 1,
            category: "score:47:subject:math".to_string(),
            user_id: 9,
            task_id: 100,
        };

        let raw = keys.reservation_key(&reservation);
        assert_eq!(
            raw,
            "cs:reserve_task:project:1:category:score:47:subject:math:user:9:task:100"
        );
        assert_eq!(keys.parse_reservation_key(&raw), Some(reservation));
    }

    #[test]
    fn test_reservation_pattern_wildcards() {
        let keys = KeySpace::new("cs");
        assert_eq!(
            keys.reservation_pattern(1, Some("score:*:subject:*"), Some(9), None),
            "cs:reserve_task:project:1:category:score:*:subject:*:user:9:task:*"
        );
        assert_eq!(
            keys.reservation_pattern(1, None, None, None),
            "cs:reserve_task:project:1:category:*:user:*:task:*"
        );
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        let keys = KeySpace::new("cs");
        assert!(keys.parse_reservation_key("cs:task:users:1").is_none());
        assert!(keys
            .parse_reservation_key("other:reserve_task:project:1:category:a:b:user:1:task:2")
            .is_none());
        assert!(keys
            .parse_reservation_key("cs:reserve_task:project:x:category:a:b:user:1:task:2")
            .is_none());
    }
}
