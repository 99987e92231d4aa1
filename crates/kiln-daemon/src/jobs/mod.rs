pub mod download;
pub mod progress;
pub mod provision;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU8, Ordering},
};

use kiln_process::InstanceId;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, HubEvent, job_group};

pub use progress::{JobProgress, ProgressCache};
pub use provision::{CreateInstanceRequest, Provisioner};

/// A queued unit of work. The ID is also the ID of the instance it creates and the key of
/// its broadcast group.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: InstanceId,
    pub request: CreateInstanceRequest,
}

/// Executes one job. Returns the final success message.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(
        &self,
        job: Job,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String>;
}

/// Publishes progress of one job to `job:{id}`.
#[derive(Clone)]
pub struct Reporter {
    hub: Arc<Broadcaster>,
    group: String,
    percent: Arc<AtomicU8>,
}

impl Reporter {
    fn new(hub: Arc<Broadcaster>, id: InstanceId) -> Self {
        Self {
            hub,
            group: job_group(id.0),
            percent: Arc::new(AtomicU8::new(0)),
        }
    }

    fn publish(&self, percent: u8, message: String, done: bool, success: bool) {
        self.percent.store(percent, Ordering::Relaxed);
        self.hub.publish(
            &self.group,
            HubEvent::Progress {
                percent,
                message,
                done,
                success,
            },
        );
    }

    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        self.publish(percent.min(99), message.into(), false, false);
    }

    fn finish(&self, message: String) {
        self.publish(100, message, true, true);
    }

    fn fail(&self, message: String) {
        let percent = self.percent.load(Ordering::Relaxed);
        self.publish(percent, message, true, false);
    }
}

/// Bounded FIFO of jobs served by a fixed set of workers.
///
/// `enqueue` waits while the queue is full. Jobs are never dropped, duplicated or retried.
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    hub: Arc<Broadcaster>,
    progress: Arc<ProgressCache>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn start(
        runner: Arc<dyn JobRunner>,
        hub: Arc<Broadcaster>,
        progress: Arc<ProgressCache>,
        capacity: usize,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|n| {
                tokio::spawn(worker(
                    n,
                    rx.clone(),
                    runner.clone(),
                    hub.clone(),
                    progress.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        Self {
            tx,
            hub,
            progress,
            cancel,
            workers: Mutex::new(handles),
        }
    }

    /// Registers the job's progress group and queues it, waiting for space.
    pub async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        let id = job.id;
        self.hub.attach(
            &job_group(id.0),
            Arc::new(progress::JobReplay {
                cache: self.progress.clone(),
                job_id: id.0,
            }),
        );
        Reporter::new(self.hub.clone(), id).progress(0, "queued");
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("job workers have shut down"))?;
        tracing::info!(job = %id, "job queued");
        Ok(())
    }

    pub fn progress(&self, id: u32) -> Option<JobProgress> {
        self.progress.get(id)
    }

    /// Cancels workers between phases and waits for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for h in handles {
            let _ = h.await;
        }
    }
}

async fn worker(
    n: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    runner: Arc<dyn JobRunner>,
    hub: Arc<Broadcaster>,
    progress: Arc<ProgressCache>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = async { rx.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };

        let id = job.id;
        let reporter = Reporter::new(hub.clone(), id);
        tracing::info!(worker = n, job = %id, "job started");

        // A panicking job only takes down its own task.
        let handle = tokio::spawn({
            let runner = runner.clone();
            let reporter = reporter.clone();
            let cancel = cancel.clone();
            async move { runner.run(job, &reporter, &cancel).await }
        });
        match handle.await {
            Ok(Ok(message)) => {
                tracing::info!(worker = n, job = %id, "job finished");
                reporter.finish(message);
            }
            Ok(Err(err)) => {
                tracing::warn!(worker = n, job = %id, error = %format!("{err:#}"), "job failed");
                reporter.fail(format!("{err:#}"));
            }
            Err(err) => {
                tracing::error!(worker = n, job = %id, %err, "job aborted");
                reporter.fail(if err.is_panic() {
                    "job panicked".to_string()
                } else {
                    "job aborted".to_string()
                });
            }
        }

        let hub = hub.clone();
        let ttl = progress.done_ttl();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            hub.detach(&job_group(id.0));
        });
    }
    tracing::debug!(worker = n, "job worker exiting");
}
