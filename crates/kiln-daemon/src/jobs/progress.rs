use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::broadcast::{HubEvent, Replay};

/// Latest known state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub job_id: u32,
    pub percent: u8,
    pub message: String,
    pub done: bool,
    pub success: bool,
    pub updated_at_unix_ms: u64,
}

impl JobProgress {
    fn to_event(&self) -> HubEvent {
        HubEvent::Progress {
            percent: self.percent,
            message: self.message.clone(),
            done: self.done,
            success: self.success,
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Short-lived job status: finished jobs are kept for `done_ttl`, anything else for
/// `stale_ttl` after its last update.
#[derive(Debug)]
pub struct ProgressCache {
    entries: Mutex<HashMap<u32, JobProgress>>,
    done_ttl: Duration,
    stale_ttl: Duration,
}

impl Default for ProgressCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(10 * 60), Duration::from_secs(60 * 60))
    }
}

impl ProgressCache {
    pub fn new(done_ttl: Duration, stale_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            done_ttl,
            stale_ttl,
        }
    }

    pub fn done_ttl(&self) -> Duration {
        self.done_ttl
    }

    fn cleanup_locked(&self, map: &mut HashMap<u32, JobProgress>) {
        let now = now_unix_ms();
        let done_ms = self.done_ttl.as_millis() as u64;
        let stale_ms = self.stale_ttl.as_millis() as u64;
        map.retain(|_, p| {
            let age = now.saturating_sub(p.updated_at_unix_ms);
            if p.done { age <= done_ms } else { age <= stale_ms }
        });
    }

    pub fn update(&self, job_id: u32, percent: u8, message: &str, done: bool, success: bool) {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        self.cleanup_locked(&mut map);
        map.insert(
            job_id,
            JobProgress {
                job_id,
                percent: percent.min(100),
                message: message.to_string(),
                done,
                success,
                updated_at_unix_ms: now_unix_ms(),
            },
        );
    }

    pub fn get(&self, job_id: u32) -> Option<JobProgress> {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        self.cleanup_locked(&mut map);
        map.get(&job_id).cloned()
    }
}

/// Replay source of one `job:{id}` group, backed by the shared cache.
pub(crate) struct JobReplay {
    pub(crate) cache: Arc<ProgressCache>,
    pub(crate) job_id: u32,
}

impl Replay for JobReplay {
    fn record(&self, event: &HubEvent) {
        if let HubEvent::Progress {
            percent,
            message,
            done,
            success,
        } = event
        {
            self.cache
                .update(self.job_id, *percent, message, *done, *success);
        }
    }

    fn replay(&self) -> Vec<HubEvent> {
        self.cache
            .get(self.job_id)
            .map(|p| vec![p.to_event()])
            .unwrap_or_default()
    }
}
