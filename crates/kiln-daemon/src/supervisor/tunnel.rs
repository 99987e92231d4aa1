use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use kiln_process::{TunnelId, TunnelState, TunnelStatus};

use super::{
    SupervisorError,
    child::{self, ChildControl, LaunchSpec},
    logs::{LogBuffer, LogSink},
};
use crate::{
    broadcast::{Broadcaster, tunnel_group},
    store::{ConfigFormat, ConfigStore, Tunnel, TunnelStore},
};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Parses a tunnel client payload in its declared format.
pub fn check_config(format: ConfigFormat, text: &str) -> Result<(), String> {
    match format {
        ConfigFormat::Toml => text
            .parse::<toml::Table>()
            .map(|_| ())
            .map_err(|e| e.message().to_string()),
        ConfigFormat::Json => serde_json::from_str::<serde_json::Value>(text)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        ConfigFormat::Yaml => serde_yaml::from_str::<serde_yaml::Value>(text)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        ConfigFormat::Ini => {
            for (n, raw) in text.lines().enumerate() {
                let line = raw.trim();
                if line.is_empty() || line.starts_with(['#', ';']) {
                    continue;
                }
                let section = line.starts_with('[') && line.ends_with(']');
                if !section && !line.contains('=') {
                    return Err(format!("line {}: expected `[section]` or `key = value`", n + 1));
                }
            }
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    state: TunnelState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    generation: u64,
    control: Option<ChildControl>,
}

struct Slot {
    id: TunnelId,
    op: tokio::sync::Mutex<()>,
    entry: Mutex<Entry>,
    logs: Arc<LogBuffer>,
    sink: LogSink,
}

impl Slot {
    fn entry(&self) -> std::sync::MutexGuard<'_, Entry> {
        self.entry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> TunnelStatus {
        let e = self.entry();
        TunnelStatus {
            id: self.id,
            state: e.state,
            pid: e.pid,
            exit_code: e.exit_code,
        }
    }
}

struct Inner {
    tunnels: Arc<TunnelStore>,
    config: Arc<ConfigStore>,
    hub: Arc<Broadcaster>,
    root: PathBuf,
    slots: Mutex<HashMap<TunnelId, Arc<Slot>>>,
}

/// Runs tunnel client processes. Same shape as the instance supervisor, minus the console
/// and the restart policy.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    /// `data_root` receives the rendered client configs under `tunnels/<id>/`.
    pub fn new(
        tunnels: Arc<TunnelStore>,
        config: Arc<ConfigStore>,
        hub: Arc<Broadcaster>,
        data_root: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tunnels,
                config,
                hub,
                root: data_root.join("tunnels"),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<TunnelId, Arc<Slot>>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn existing_slot(&self, id: TunnelId) -> Option<Arc<Slot>> {
        self.slots().get(&id).cloned()
    }

    fn slot(&self, id: TunnelId, max_lines: usize) -> Arc<Slot> {
        self.slots()
            .entry(id)
            .or_insert_with(|| {
                let logs = Arc::new(LogBuffer::new(max_lines));
                let sink = LogSink::attach(self.inner.hub.clone(), tunnel_group(id), logs.clone());
                Arc::new(Slot {
                    id,
                    op: tokio::sync::Mutex::new(()),
                    entry: Mutex::new(Entry::default()),
                    logs,
                    sink,
                })
            })
            .clone()
    }

    pub fn is_running(&self, id: TunnelId) -> bool {
        self.existing_slot(id)
            .is_some_and(|s| s.entry().state == TunnelState::Running)
    }

    pub fn status(&self, id: TunnelId) -> TunnelStatus {
        self.existing_slot(id)
            .map(|s| s.status())
            .unwrap_or(TunnelStatus {
                id,
                state: TunnelState::Stopped,
                pid: None,
                exit_code: None,
            })
    }

    pub fn logs(&self, id: TunnelId) -> Vec<String> {
        self.existing_slot(id)
            .map(|s| s.logs.snapshot())
            .unwrap_or_default()
    }

    fn config_path(&self, tunnel: &Tunnel) -> PathBuf {
        self.inner
            .root
            .join(tunnel.id.to_string())
            .join(format!("frpc.{}", tunnel.config_format.extension()))
    }

    async fn render_config(&self, tunnel: &Tunnel) -> anyhow::Result<PathBuf> {
        check_config(tunnel.config_format, &tunnel.config)
            .map_err(|e| {
                anyhow::anyhow!("invalid {} config: {e}", tunnel.config_format.extension())
            })?;
        let path = self.config_path(tunnel);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }
        tokio::fs::write(&path, tunnel.config.as_bytes())
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub async fn start(&self, id: TunnelId) -> Result<TunnelStatus, SupervisorError> {
        let tunnel = self
            .inner
            .tunnels
            .get(id)
            .await
            .ok_or_else(|| SupervisorError::NotFound(format!("tunnel {id}")))?;
        let settings = self.inner.config.settings().await;
        let slot = self.slot(id, settings.log_max_lines);

        let _op = slot.op.lock().await;
        if slot.entry().state == TunnelState::Running {
            return Err(SupervisorError::AlreadyRunning(format!("tunnel {id}")));
        }
        slot.logs.clear();

        let spawned = match self.render_config(&tunnel).await {
            Ok(path) => {
                let spec = LaunchSpec {
                    exec: settings.frpc_path.clone(),
                    args: vec!["-c".to_string(), path.display().to_string()],
                    cwd: path
                        .parent()
                        .map(PathBuf::from)
                        .unwrap_or_else(|| self.inner.root.clone()),
                };
                tracing::info!(tunnel = %id, command = %spec, "starting tunnel");
                child::spawn_captured(&spec, encoding_rs::UTF_8, slot.sink.clone())
            }
            Err(err) => Err(err),
        };
        let spawned = match spawned {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(tunnel = %id, error = %format!("{err:#}"), "tunnel start failed");
                slot.sink.emit(format!("[kiln] start failed: {err:#}"));
                return Err(SupervisorError::Spawn(format!("tunnel {id}"), err));
            }
        };

        let control = spawned.control;
        let generation = {
            let mut e = slot.entry();
            e.generation += 1;
            e.state = TunnelState::Running;
            e.pid = control.pid();
            e.exit_code = None;
            e.control = Some(control.clone());
            e.generation
        };
        tokio::spawn(watch_exit(slot.clone(), control, generation));
        slot.sink.state(TunnelState::Running.as_str());
        Ok(slot.status())
    }

    /// SIGTERM, a short grace period, then a kill.
    pub async fn stop(&self, id: TunnelId) -> Result<TunnelStatus, SupervisorError> {
        let not_running = || SupervisorError::NotRunning(format!("tunnel {id}"));
        let slot = self.existing_slot(id).ok_or_else(not_running)?;
        let _op = slot.op.lock().await;
        self.stop_locked(&slot).await
    }

    async fn stop_locked(&self, slot: &Arc<Slot>) -> Result<TunnelStatus, SupervisorError> {
        let control = {
            let e = slot.entry();
            if e.state != TunnelState::Running {
                return Err(SupervisorError::NotRunning(format!("tunnel {}", slot.id)));
            }
            e.control.clone()
        };

        let mut report = None;
        if let Some(control) = control {
            control.terminate();
            report = control.wait(STOP_GRACE).await;
            if report.is_none() {
                tracing::warn!(tunnel = %slot.id, "tunnel ignored SIGTERM, killing");
                control.kill();
                report = control.wait(STOP_GRACE).await;
            }
        }

        {
            let mut e = slot.entry();
            e.generation += 1;
            e.state = TunnelState::Stopped;
            e.pid = None;
            e.control = None;
            e.exit_code = report.and_then(|r| r.code);
        }
        slot.sink.state(TunnelState::Stopped.as_str());
        tracing::info!(tunnel = %slot.id, "tunnel stopped");
        Ok(slot.status())
    }

    /// Forgets a stopped tunnel and removes its rendered config.
    /// Waits for any start or stop in flight on the tunnel.
    pub async fn remove(&self, id: TunnelId) -> Result<(), SupervisorError> {
        let slot = self.existing_slot(id);
        let _op = match &slot {
            Some(slot) => Some(slot.op.lock().await),
            None => None,
        };
        if let Some(slot) = &slot {
            if slot.entry().state != TunnelState::Stopped {
                return Err(SupervisorError::AlreadyRunning(format!("tunnel {id}")));
            }
            let mut slots = self.slots();
            if slots.get(&id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
                slots.remove(&id);
                self.inner.hub.detach(&tunnel_group(id));
            }
        }
        let dir = self.inner.root.join(id.to_string());
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(tunnel = %id, %err, "failed to remove tunnel directory");
        }
        Ok(())
    }

    pub async fn start_on_boot(&self) {
        for tunnel in self.inner.tunnels.list().await {
            if !tunnel.run_on_startup {
                continue;
            }
            if let Err(err) = self.start(tunnel.id).await {
                tracing::warn!(tunnel = %tunnel.id, error = %err, "tunnel autostart failed");
            }
        }
    }

    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        let stops = slots.into_iter().map(|slot| {
            let sup = self.clone();
            async move {
                let _op = slot.op.lock().await;
                let _ = sup.stop_locked(&slot).await;
            }
        });
        futures_util::future::join_all(stops).await;
    }
}

async fn watch_exit(slot: Arc<Slot>, control: ChildControl, generation: u64) {
    let report = control.wait_forever().await;
    {
        let mut e = slot.entry();
        if e.generation != generation {
            return;
        }
        e.state = TunnelState::Stopped;
        e.pid = None;
        e.control = None;
        e.exit_code = report.as_ref().and_then(|r| r.code);
    }
    tracing::info!(tunnel = %slot.id, code = ?report.and_then(|r| r.code), "tunnel exited");
    slot.sink.state(TunnelState::Stopped.as_str());
}
