//! Saved partial answers.
//!
//! Records which tasks a contributor started answering and saved without
//! submitting, per project. The saved timestamps drive the saved-position
//! ranking so a contributor can be sent back to unfinished work first or
//! last.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::StoreError;
use crate::kv::{format_timestamp, parse_timestamp};
use crate::locks::LockContext;

/// Index of saved, unsubmitted answers.
#[derive(Clone)]
pub struct PartialAnswers {
    ctx: LockContext,
}

impl PartialAnswers {
    pub fn new(ctx: LockContext) -> Self {
        Self { ctx }
    }

    /// Records a saved answer for `task_id`.
    ///
    /// Re-saving refreshes the timestamp. Returns false when the holder
    /// already has the maximum number of saved answers in the project.
    pub async fn save(
        &self,
        project_id: i64,
        holder_id: &str,
        task_id: i64,
    ) -> Result<bool, StoreError> {
        let saved = self.saved_tasks(project_id, holder_id).await?;
        if !saved.contains_key(&task_id) && saved.len() >= self.ctx.config.max_saved_answers {
            debug!(project_id, holder_id, task_id, "Saved answer limit reached");
            return Ok(false);
        }

        let key = self.ctx.keys.partial_answers_key(project_id, holder_id);
        self.ctx
            .store
            .hset(&key, &task_id.to_string(), &format_timestamp(self.ctx.now()))
            .await?;
        self.ctx
            .store
            .expire(&key, self.ctx.config.partial_answer_ttl)
            .await?;
        Ok(true)
    }

    /// Forgets the saved answer, typically on submission.
    pub async fn remove(
        &self,
        project_id: i64,
        holder_id: &str,
        task_id: i64,
    ) -> Result<(), StoreError> {
        let key = self.ctx.keys.partial_answers_key(project_id, holder_id);
        self.ctx.store.hdel(&key, &[task_id.to_string()]).await?;
        Ok(())
    }

    /// Saved tasks with their save timestamps; stale entries are swept.
    pub async fn saved_tasks(
        &self,
        project_id: i64,
        holder_id: &str,
    ) -> Result<BTreeMap<i64, f64>, StoreError> {
        let key = self.ctx.keys.partial_answers_key(project_id, holder_id);
        let oldest = self.ctx.now() - self.ctx.config.partial_answer_ttl.as_secs_f64();

        let mut saved = BTreeMap::new();
        let mut stale = Vec::new();
        for (field, value) in self.ctx.store.hget_all(&key).await? {
            let task_id = field.parse::<i64>().ok();
            let saved_at = parse_timestamp(&key, &value).ok();
            match (task_id, saved_at) {
                (Some(task_id), Some(saved_at)) if saved_at >= oldest => {
                    saved.insert(task_id, saved_at);
                }
                _ => stale.push(field),
            }
        }

        if !stale.is_empty() {
            self.ctx.store.hdel(&key, &stale).await?;
        }
        Ok(saved)
    }
}
