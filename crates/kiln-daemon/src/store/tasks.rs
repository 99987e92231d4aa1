use std::path::Path;

use chrono::{DateTime, Utc};
use kiln_process::InstanceId;
use serde::{Deserialize, Serialize};

use super::document::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Command,
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTask {
    pub id: String,
    pub instance_id: InstanceId,
    pub name: String,
    pub action: TaskAction,
    pub cron: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleTask {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must be non-empty".to_string());
        }
        crate::scheduler::parse_cron(&self.cron).map_err(|e| format!("cron: {e}"))?;
        if self.action == TaskAction::Command && self.payload.trim().is_empty() {
            return Err("payload must hold the command for command tasks".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskList {
    #[serde(default)]
    pub tasks: Vec<ScheduleTask>,
}

/// Persisted schedule (`tasks.json`).
#[derive(Debug)]
pub struct TaskStore {
    doc: Document<TaskList>,
}

impl TaskStore {
    pub async fn open(root: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            doc: Document::open(root.join("tasks.json")).await?,
        })
    }

    pub async fn list(&self) -> Vec<ScheduleTask> {
        self.doc.read_with(|l| l.tasks.clone()).await
    }

    pub async fn list_for(&self, instance_id: InstanceId) -> Vec<ScheduleTask> {
        self.doc
            .read_with(|l| {
                l.tasks
                    .iter()
                    .filter(|t| t.instance_id == instance_id)
                    .cloned()
                    .collect()
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Option<ScheduleTask> {
        self.doc
            .read_with(|l| l.tasks.iter().find(|t| t.id == id).cloned())
            .await
    }

    pub async fn create(&self, task: ScheduleTask) -> anyhow::Result<bool> {
        let created = self
            .doc
            .update(|l| {
                if l.tasks.iter().any(|t| t.id == task.id) {
                    return None;
                }
                l.tasks.push(task);
                Some(())
            })
            .await?;
        Ok(created.is_some())
    }

    /// Full replace. `last_run` is carried over from the stored task so it never moves
    /// backwards through an update.
    pub async fn update(&self, mut task: ScheduleTask) -> anyhow::Result<bool> {
        let updated = self
            .doc
            .update(|l| {
                let slot = l.tasks.iter_mut().find(|t| t.id == task.id)?;
                task.last_run = slot.last_run.max(task.last_run);
                *slot = task;
                Some(())
            })
            .await?;
        Ok(updated.is_some())
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let deleted = self
            .doc
            .update(|l| {
                let pos = l.tasks.iter().position(|t| t.id == id)?;
                l.tasks.remove(pos);
                Some(())
            })
            .await?;
        Ok(deleted.is_some())
    }

    pub async fn delete_for(&self, instance_id: InstanceId) -> anyhow::Result<usize> {
        let removed = self
            .doc
            .update(|l| {
                let before = l.tasks.len();
                l.tasks.retain(|t| t.instance_id != instance_id);
                let removed = before - l.tasks.len();
                (removed > 0).then_some(removed)
            })
            .await?;
        Ok(removed.unwrap_or(0))
    }

    /// Selects the enabled tasks for which `is_due(task)` holds, stamps their `last_run`
    /// with `now` and persists, all under one write lock. Returns the stamped tasks.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        mut is_due: impl FnMut(&ScheduleTask) -> bool,
    ) -> anyhow::Result<Vec<ScheduleTask>> {
        let claimed = self
            .doc
            .update(|l| {
                let mut out = Vec::new();
                for t in l.tasks.iter_mut() {
                    if !t.enabled || t.last_run.is_some_and(|last| last >= now) {
                        continue;
                    }
                    if is_due(t) {
                        t.last_run = Some(now);
                        out.push(t.clone());
                    }
                }
                (!out.is_empty()).then_some(out)
            })
            .await?;
        Ok(claimed.unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) fn test_task(instance: u32, cron: &str, action: TaskAction) -> ScheduleTask {
    ScheduleTask {
        id: uuid::Uuid::new_v4().to_string(),
        instance_id: InstanceId(instance),
        name: "task".to_string(),
        action,
        cron: cron.to_string(),
        payload: String::new(),
        enabled: true,
        last_run: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_never_moves_last_run_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        let mut t = test_task(1, "* * * * *", TaskAction::Start);
        let later = Utc::now();
        t.last_run = Some(later);
        store.create(t.clone()).await.unwrap();

        t.last_run = Some(later - chrono::Duration::hours(1));
        t.name = "renamed".to_string();
        assert!(store.update(t.clone()).await.unwrap());
        let stored = store.get(&t.id).await.unwrap();
        assert_eq!(stored.last_run, Some(later));
        assert_eq!(stored.name, "renamed");
    }

    #[tokio::test]
    async fn claim_skips_disabled_and_already_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        let now = Utc::now();

        let mut disabled = test_task(1, "* * * * *", TaskAction::Start);
        disabled.enabled = false;
        let mut stamped = test_task(1, "* * * * *", TaskAction::Start);
        stamped.last_run = Some(now);
        let fresh = test_task(1, "* * * * *", TaskAction::Start);
        for t in [disabled, stamped, fresh.clone()] {
            store.create(t).await.unwrap();
        }

        let claimed = store.claim_due(now, |_| true).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, fresh.id);
        assert!(store.claim_due(now, |_| true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_for_instance_removes_only_its_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        store.create(test_task(1, "* * * * *", TaskAction::Start)).await.unwrap();
        store.create(test_task(2, "* * * * *", TaskAction::Stop)).await.unwrap();
        assert_eq!(store.delete_for(InstanceId(1)).await.unwrap(), 1);
        assert_eq!(store.list().await.len(), 1);
        assert_eq!(store.list_for(InstanceId(2)).await.len(), 1);
    }
}
