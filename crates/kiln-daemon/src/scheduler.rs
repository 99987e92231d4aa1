use std::{collections::HashSet, sync::Arc, sync::Mutex, time::Duration};

use chrono::{DateTime, Local, TimeZone, Utc};
use croner::Cron;
use kiln_process::InstanceId;
use tokio_util::sync::CancellationToken;

use crate::store::{ScheduleTask, TaskAction, TaskStore};

/// Parses a 5- or 6-field cron expression (seconds optional). Fields are matched against
/// the daemon host's local wall clock, so `0 4 * * *` fires at 04:00 local time.
pub fn parse_cron(expr: &str) -> Result<Cron, croner::errors::CronError> {
    Cron::new(expr.trim()).with_seconds_optional().parse()
}

/// A task is due once the first occurrence after `max(last_run, started_at)` has passed.
/// Occurrences are computed on the wall clock of `zone`.
pub fn is_due<Tz: TimeZone>(
    cron: &Cron,
    last_run: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    zone: &Tz,
) -> bool {
    let after = last_run.map_or(started_at, |last| last.max(started_at));
    cron.find_next_occurrence(&after.with_timezone(zone), false)
        .is_ok_and(|next| next.with_timezone(&Utc) <= now)
}

/// Receiver of scheduled actions.
#[async_trait::async_trait]
pub trait TaskDispatcher: Send + Sync + 'static {
    async fn dispatch(
        &self,
        instance: InstanceId,
        action: TaskAction,
        payload: &str,
    ) -> anyhow::Result<()>;
}

pub struct Scheduler {
    tasks: Arc<TaskStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    started_at: DateTime<Utc>,
    reported_invalid: Mutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(tasks: Arc<TaskStore>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self::starting_at(tasks, dispatcher, Utc::now())
    }

    pub fn starting_at(
        tasks: Arc<TaskStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tasks,
            dispatcher,
            started_at,
            reported_invalid: Mutex::new(HashSet::new()),
        }
    }

    fn due(&self, task: &ScheduleTask, now: DateTime<Utc>) -> bool {
        match parse_cron(&task.cron) {
            Ok(cron) => is_due(&cron, task.last_run, self.started_at, now, &Local),
            Err(err) => {
                let mut reported = self.reported_invalid.lock().unwrap_or_else(|e| e.into_inner());
                if reported.insert(task.id.clone()) {
                    tracing::warn!(
                        task = %task.id,
                        cron = %task.cron,
                        %err,
                        "invalid cron expression"
                    );
                }
                false
            }
        }
    }

    /// Claims every due task at `now` and dispatches each on its own task.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduleTask>> {
        let claimed = self.tasks.claim_due(now, |t| self.due(t, now)).await?;
        for task in &claimed {
            let dispatcher = self.dispatcher.clone();
            let task = task.clone();
            tokio::spawn(async move {
                tracing::info!(
                    task = %task.id,
                    instance = %task.instance_id,
                    action = ?task.action,
                    "running scheduled task"
                );
                if let Err(err) = dispatcher
                    .dispatch(task.instance_id, task.action, &task.payload)
                    .await
                {
                    tracing::warn!(
                        task = %task.id,
                        error = %format!("{err:#}"),
                        "scheduled task failed"
                    );
                }
            });
        }
        Ok(claimed)
    }

    /// Evaluates the schedule every second until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.tick(Utc::now()).await {
                tracing::warn!(error = %format!("{err:#}"), "scheduler tick failed");
            }
        }
        tracing::debug!("scheduler stopped");
    }
}
