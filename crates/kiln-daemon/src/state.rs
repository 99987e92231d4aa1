use std::{path::Path, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    broadcast::Broadcaster,
    jobs::{JobQueue, ProgressCache, Provisioner},
    security::FailureTracker,
    store::{ConfigStore, IdentityStore, TaskStore, TunnelStore},
    supervisor::{InstanceSupervisor, TunnelSupervisor},
};

/// Services shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub tasks: Arc<TaskStore>,
    pub tunnel_defs: Arc<TunnelStore>,
    pub identities: Arc<IdentityStore>,
    pub hub: Arc<Broadcaster>,
    pub instances: InstanceSupervisor,
    pub tunnels: TunnelSupervisor,
    pub jobs: Arc<JobQueue>,
    pub guard: Arc<FailureTracker>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Opens every document under `root` and wires the services together. Spawns the job
    /// workers and the restart dispatcher; the scheduler is started separately.
    pub async fn open(root: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let config = Arc::new(ConfigStore::open(root).await?);
        let tasks = Arc::new(TaskStore::open(root).await?);
        let tunnel_defs = Arc::new(TunnelStore::open(root).await?);
        let identities = Arc::new(IdentityStore::open(root).await?);
        let hub = Arc::new(Broadcaster::new());
        let shutdown = CancellationToken::new();

        let settings = config.settings().await;
        let instances = InstanceSupervisor::new(config.clone(), hub.clone());
        let tunnels = TunnelSupervisor::new(
            tunnel_defs.clone(),
            config.clone(),
            hub.clone(),
            root.to_path_buf(),
        );
        let jobs = Arc::new(JobQueue::start(
            Arc::new(Provisioner::new(config.clone())?),
            hub.clone(),
            Arc::new(ProgressCache::default()),
            settings.job_queue_capacity,
            settings.job_workers,
            shutdown.child_token(),
        ));

        Ok(Self {
            config,
            tasks,
            tunnel_defs,
            identities,
            hub,
            instances,
            tunnels,
            jobs,
            guard: Arc::new(FailureTracker::new()),
            shutdown,
        })
    }
}
