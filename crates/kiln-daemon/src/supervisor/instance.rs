use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use encoding_rs::Encoding;
use kiln_process::{InstanceId, InstanceState, InstanceStatus};
use tokio::sync::mpsc;

use super::{
    SupervisorError,
    child::{self, ChildControl, ExitReport, StdinHandle},
    launch::instance_launch_spec,
    logs::{LogBuffer, LogSink},
    restart::{self, ExitCause, RestartConfig, RestartDecision},
};
use crate::{
    broadcast::{Broadcaster, instance_group},
    scheduler::TaskDispatcher,
    store::{ConfigStore, Instance, Settings, TaskAction},
};

const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Entry {
    state: InstanceState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    message: Option<String>,
    restart_attempts: u32,
    stop_requested: bool,
    // Bumped on every spawn and on a cancelled restart; stale exits and restarts compare it.
    generation: u64,
    stdin: Option<StdinHandle>,
    control: Option<ChildControl>,
    input_encoding: &'static Encoding,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: InstanceState::Stopped,
            pid: None,
            exit_code: None,
            message: None,
            restart_attempts: 0,
            stop_requested: false,
            generation: 0,
            stdin: None,
            control: None,
            input_encoding: encoding_rs::UTF_8,
        }
    }

    fn status(&self, id: InstanceId) -> InstanceStatus {
        InstanceStatus {
            id,
            state: self.state,
            pid: self.pid,
            exit_code: self.exit_code,
            restart_attempts: self.restart_attempts,
            message: self.message.clone(),
        }
    }
}

struct Slot {
    id: InstanceId,
    // Serializes start/stop/restart of this instance.
    op: tokio::sync::Mutex<()>,
    entry: Mutex<Entry>,
    logs: Arc<LogBuffer>,
    sink: LogSink,
}

impl Slot {
    fn entry(&self) -> std::sync::MutexGuard<'_, Entry> {
        self.entry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> InstanceStatus {
        self.entry().status(self.id)
    }
}

#[derive(Debug)]
struct RestartRequest {
    id: InstanceId,
    generation: u64,
    delay: Duration,
}

struct Inner {
    config: Arc<ConfigStore>,
    hub: Arc<Broadcaster>,
    slots: Mutex<HashMap<InstanceId, Arc<Slot>>>,
    restart_tx: mpsc::UnboundedSender<RestartRequest>,
}

/// Owns the child processes of all instances and their log buffers.
///
/// Every instance has at most one live child. Start, stop and restart of the same instance
/// are serialized; different instances proceed independently.
#[derive(Clone)]
pub struct InstanceSupervisor {
    inner: Arc<Inner>,
}

impl InstanceSupervisor {
    /// Must be called inside a tokio runtime; spawns the restart dispatcher.
    pub fn new(config: Arc<ConfigStore>, hub: Arc<Broadcaster>) -> Self {
        let (restart_tx, mut restart_rx) = mpsc::unbounded_channel::<RestartRequest>();
        let inner = Arc::new(Inner {
            config,
            hub,
            slots: Mutex::new(HashMap::new()),
            restart_tx,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(req) = restart_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let sup = InstanceSupervisor { inner };
                tokio::spawn(async move {
                    tokio::time::sleep(req.delay).await;
                    sup.policy_restart(req.id, req.generation).await;
                });
            }
        });

        Self { inner }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, Arc<Slot>>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn existing_slot(&self, id: InstanceId) -> Option<Arc<Slot>> {
        self.slots().get(&id).cloned()
    }

    fn slot(&self, id: InstanceId, max_lines: usize) -> Arc<Slot> {
        let mut slots = self.slots();
        slots
            .entry(id)
            .or_insert_with(|| {
                let logs = Arc::new(LogBuffer::new(max_lines));
                let sink =
                    LogSink::attach(self.inner.hub.clone(), instance_group(id), logs.clone());
                Arc::new(Slot {
                    id,
                    op: tokio::sync::Mutex::new(()),
                    entry: Mutex::new(Entry::new()),
                    logs,
                    sink,
                })
            })
            .clone()
    }

    pub fn state(&self, id: InstanceId) -> InstanceState {
        self.existing_slot(id)
            .map(|s| s.entry().state)
            .unwrap_or_default()
    }

    pub fn status(&self, id: InstanceId) -> InstanceStatus {
        self.existing_slot(id)
            .map(|s| s.status())
            .unwrap_or_else(|| InstanceStatus::stopped(id))
    }

    pub fn statuses(&self, ids: impl IntoIterator<Item = InstanceId>) -> Vec<InstanceStatus> {
        ids.into_iter().map(|id| self.status(id)).collect()
    }

    /// Snapshot of the retained output, oldest first.
    pub fn logs(&self, id: InstanceId) -> Vec<String> {
        self.existing_slot(id)
            .map(|s| s.logs.snapshot())
            .unwrap_or_default()
    }

    /// Retained lines after `cursor` plus the new cursor.
    pub fn tail_logs(&self, id: InstanceId, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.existing_slot(id)
            .map(|s| s.logs.tail_after(cursor, limit))
            .unwrap_or((Vec::new(), cursor))
    }

    pub async fn start(&self, id: InstanceId) -> Result<InstanceStatus, SupervisorError> {
        let instance = self
            .inner
            .config
            .instance(id)
            .await
            .ok_or_else(|| SupervisorError::NotFound(format!("instance {id}")))?;
        let settings = self.inner.config.settings().await;
        let slot = self.slot(id, settings.log_max_lines);

        let _op = slot.op.lock().await;
        if slot.entry().state != InstanceState::Stopped {
            return Err(SupervisorError::AlreadyRunning(format!("instance {id}")));
        }
        slot.logs.set_max_lines(settings.log_max_lines);
        slot.logs.clear();
        self.start_locked(&slot, &instance, &settings, true)
    }

    // Caller holds the slot's op lock.
    fn start_locked(
        &self,
        slot: &Arc<Slot>,
        instance: &Instance,
        settings: &Settings,
        fresh: bool,
    ) -> Result<InstanceStatus, SupervisorError> {
        let id = instance.id;
        {
            let mut e = slot.entry();
            e.state = InstanceState::Starting;
            e.stop_requested = false;
            e.exit_code = None;
            e.message = Some("starting".to_string());
            if fresh {
                e.restart_attempts = 0;
            }
        }
        slot.sink.state(InstanceState::Starting.as_str());

        let spawned = if instance.base_path.is_dir() {
            let spec = instance_launch_spec(instance);
            tracing::info!(instance = %id, command = %spec, "starting instance");
            child::spawn_captured(
                &spec,
                child::resolve_encoding(&instance.output_encoding),
                slot.sink.clone(),
            )
        } else {
            Err(anyhow::anyhow!(
                "base path {} is not a directory",
                instance.base_path.display()
            ))
        };

        let spawned = match spawned {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(instance = %id, error = %format!("{err:#}"), "start failed");
                {
                    let mut e = slot.entry();
                    e.state = InstanceState::Stopped;
                    e.message = Some(format!("start failed: {err:#}"));
                }
                slot.sink.emit(format!("[kiln] start failed: {err:#}"));
                slot.sink.state(InstanceState::Stopped.as_str());
                return Err(SupervisorError::Spawn(format!("instance {id}"), err));
            }
        };

        let control = spawned.control.clone();
        let status = {
            let mut e = slot.entry();
            e.generation += 1;
            e.state = InstanceState::Running;
            e.pid = control.pid();
            e.message = None;
            e.stdin = Some(spawned.stdin);
            e.control = Some(spawned.control);
            e.input_encoding = child::resolve_encoding(&instance.input_encoding);
            let generation = e.generation;

            tokio::spawn(monitor(
                self.inner.clone(),
                slot.clone(),
                control,
                generation,
                RestartConfig::new(instance, settings),
            ));
            e.status(id)
        };
        slot.sink.state(InstanceState::Running.as_str());
        Ok(status)
    }

    /// Sends the stop command, escalating to a kill after the configured timeout. Returns
    /// once the process is gone. A pending policy restart is cancelled instead.
    pub async fn stop(&self, id: InstanceId) -> Result<InstanceStatus, SupervisorError> {
        let slot = self
            .existing_slot(id)
            .ok_or_else(|| SupervisorError::NotRunning(format!("instance {id}")))?;
        let _op = slot.op.lock().await;
        self.stop_locked(&slot).await
    }

    async fn stop_locked(&self, slot: &Arc<Slot>) -> Result<InstanceStatus, SupervisorError> {
        let id = slot.id;
        let (control, stdin, encoding) = {
            let mut e = slot.entry();
            match e.state {
                InstanceState::Stopped => {
                    return Err(SupervisorError::NotRunning(format!("instance {id}")));
                }
                InstanceState::Restarting => {
                    e.generation += 1;
                    e.state = InstanceState::Stopped;
                    e.message = Some("restart cancelled".to_string());
                    let status = e.status(id);
                    drop(e);
                    slot.sink.state(InstanceState::Stopped.as_str());
                    return Ok(status);
                }
                _ => {}
            }
            e.state = InstanceState::Stopping;
            e.stop_requested = true;
            e.message = Some("stopping".to_string());
            (e.control.clone(), e.stdin.clone(), e.input_encoding)
        };
        slot.sink.state(InstanceState::Stopping.as_str());

        let report = match control {
            Some(control) => {
                let stop_command = self
                    .inner
                    .config
                    .instance(id)
                    .await
                    .map(|i| i.stop_command)
                    .unwrap_or_else(|| "stop".to_string());
                let settings = self.inner.config.settings().await;
                let timeout = Duration::from_secs(settings.stop_timeout_secs);
                terminate(&control, stdin, encoding, &stop_command, timeout).await
            }
            None => None,
        };
        if report.is_none() {
            slot.sink.emit("[kiln] process did not report an exit after kill");
        }

        let status = {
            let mut e = slot.entry();
            // The monitor may not have observed the exit yet.
            if e.state == InstanceState::Stopping {
                e.state = InstanceState::Stopped;
                e.pid = None;
                e.stdin = None;
                e.control = None;
                if let Some(r) = &report {
                    e.exit_code = r.code;
                }
                e.message = Some("stopped".to_string());
            }
            e.status(id)
        };
        slot.sink.state(InstanceState::Stopped.as_str());
        tracing::info!(instance = %id, exit_code = ?status.exit_code, "instance stopped");
        Ok(status)
    }

    /// Stop (when live) followed by a fresh start as one operation.
    pub async fn restart(&self, id: InstanceId) -> Result<InstanceStatus, SupervisorError> {
        let instance = self
            .inner
            .config
            .instance(id)
            .await
            .ok_or_else(|| SupervisorError::NotFound(format!("instance {id}")))?;
        let settings = self.inner.config.settings().await;
        let slot = self.slot(id, settings.log_max_lines);

        let _op = slot.op.lock().await;
        if slot.entry().state != InstanceState::Stopped {
            self.stop_locked(&slot).await?;
        }
        slot.logs.set_max_lines(settings.log_max_lines);
        self.start_locked(&slot, &instance, &settings, true)
    }

    async fn policy_restart(&self, id: InstanceId, generation: u64) {
        let Some(slot) = self.existing_slot(id) else {
            return;
        };
        let _op = slot.op.lock().await;
        {
            let e = slot.entry();
            if e.state != InstanceState::Restarting || e.generation != generation {
                return;
            }
        }

        let Some(instance) = self.inner.config.instance(id).await else {
            let mut e = slot.entry();
            e.state = InstanceState::Stopped;
            e.message = Some("instance removed".to_string());
            return;
        };
        let settings = self.inner.config.settings().await;
        if let Err(err) = self.start_locked(&slot, &instance, &settings, false) {
            tracing::warn!(instance = %id, error = %err, "policy restart failed");
        }
    }

    /// Writes one line to the process' stdin. Does not wait for ongoing lifecycle operations.
    pub async fn send_command(&self, id: InstanceId, text: &str) -> Result<(), SupervisorError> {
        let not_running = || SupervisorError::NotRunning(format!("instance {id}"));
        let slot = self.existing_slot(id).ok_or_else(not_running)?;
        let (stdin, encoding) = {
            let e = slot.entry();
            if e.state != InstanceState::Running {
                return Err(not_running());
            }
            (e.stdin.clone(), e.input_encoding)
        };
        let stdin = stdin.ok_or_else(not_running)?;
        if child::write_line(&stdin, encoding, text).await {
            Ok(())
        } else {
            Err(not_running())
        }
    }

    /// Forgets a stopped instance: drops its buffer and the broadcast source. Waits for
    /// any lifecycle operation in flight on the instance.
    pub async fn remove(&self, id: InstanceId) -> Result<(), SupervisorError> {
        let Some(slot) = self.existing_slot(id) else {
            return Ok(());
        };
        let _op = slot.op.lock().await;
        if slot.entry().state != InstanceState::Stopped {
            return Err(SupervisorError::AlreadyRunning(format!("instance {id}")));
        }
        let mut slots = self.slots();
        if slots.get(&id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
            slots.remove(&id);
            self.inner.hub.detach(&instance_group(id));
        }
        Ok(())
    }

    /// Starts every instance flagged `run_on_startup`. Failures are logged and skipped.
    pub async fn start_on_boot(&self) {
        for instance in self.inner.config.list_instances().await {
            if !instance.run_on_startup {
                continue;
            }
            match self.start(instance.id).await {
                Ok(_) => tracing::info!(instance = %instance.id, "autostarted"),
                Err(err) => {
                    tracing::warn!(instance = %instance.id, error = %err, "autostart failed")
                }
            }
        }
    }

    /// Stops every live instance concurrently and cancels pending restarts.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        let stops = slots.into_iter().filter_map(|slot| {
            if slot.entry().state == InstanceState::Stopped {
                return None;
            }
            let sup = self.clone();
            Some(async move {
                let _op = slot.op.lock().await;
                if let Err(err) = sup.stop_locked(&slot).await {
                    tracing::debug!(instance = %slot.id, error = %err, "shutdown stop skipped");
                }
            })
        });
        futures_util::future::join_all(stops).await;
    }
}

async fn terminate(
    control: &ChildControl,
    stdin: Option<StdinHandle>,
    encoding: &'static Encoding,
    stop_command: &str,
    timeout: Duration,
) -> Option<ExitReport> {
    let sent = match stdin {
        Some(stdin) if !stop_command.trim().is_empty() => {
            child::write_line(&stdin, encoding, stop_command).await
        }
        _ => false,
    };
    if !sent {
        control.terminate();
    }

    if let Some(report) = control.wait(timeout).await {
        return Some(report);
    }
    tracing::warn!(
        pid = ?control.pid(),
        timeout_secs = timeout.as_secs(),
        "stop timed out, killing"
    );
    control.kill();
    control.wait(KILL_GRACE).await
}

async fn monitor(
    inner: Arc<Inner>,
    slot: Arc<Slot>,
    control: ChildControl,
    generation: u64,
    cfg: RestartConfig,
) {
    let report = control.wait_forever().await.unwrap_or(ExitReport {
        code: None,
        success: false,
        runtime: Duration::ZERO,
        error: Some("exit status lost".to_string()),
    });

    let id = slot.id;
    let (decision, state) = {
        let mut e = slot.entry();
        if e.generation != generation {
            return;
        }
        e.pid = None;
        e.stdin = None;
        e.control = None;
        e.exit_code = report.code;

        let cause = ExitCause::classify(&report, e.stop_requested);
        let decision = restart::decide(cfg, cause, report.runtime, e.restart_attempts);
        match decision {
            RestartDecision::Stay => {
                e.state = InstanceState::Stopped;
                e.message = Some(exit_message(&report));
            }
            RestartDecision::Restart { attempt, delay } => {
                e.state = InstanceState::Restarting;
                e.restart_attempts = attempt;
                e.message = Some(format!(
                    "{}; restart {attempt}/{} in {}ms",
                    exit_message(&report),
                    cfg.max_retries,
                    delay.as_millis()
                ));
            }
            RestartDecision::GiveUp { attempts } => {
                e.state = InstanceState::Stopped;
                e.message = Some(format!(
                    "{}; gave up after {attempts} restarts",
                    exit_message(&report)
                ));
            }
        }
        (decision, e.state)
    };

    match decision {
        RestartDecision::Stay => {
            tracing::info!(instance = %id, code = ?report.code, "instance exited");
        }
        RestartDecision::Restart { attempt, delay } => {
            tracing::warn!(
                instance = %id,
                code = ?report.code,
                attempt,
                ?delay,
                "instance exited, restarting"
            );
            slot.sink.emit(format!(
                "[kiln] {}; restarting in {}ms (attempt {attempt})",
                exit_message(&report),
                delay.as_millis()
            ));
            let _ = inner.restart_tx.send(RestartRequest {
                id,
                generation,
                delay,
            });
        }
        RestartDecision::GiveUp { attempts } => {
            tracing::warn!(instance = %id, attempts, "restart limit reached");
            slot.sink.emit(format!(
                "[kiln] {}; giving up after {attempts} restarts",
                exit_message(&report)
            ));
        }
    }
    slot.sink.state(state.as_str());
}

fn exit_message(report: &ExitReport) -> String {
    match (&report.error, report.code) {
        (Some(err), _) => err.clone(),
        (None, Some(code)) => format!("exited with code {code}"),
        (None, None) => "terminated by signal".to_string(),
    }
}

#[async_trait::async_trait]
impl TaskDispatcher for InstanceSupervisor {
    async fn dispatch(
        &self,
        instance: InstanceId,
        action: TaskAction,
        payload: &str,
    ) -> anyhow::Result<()> {
        match action {
            TaskAction::Command => self.send_command(instance, payload).await?,
            TaskAction::Start => {
                self.start(instance).await?;
            }
            TaskAction::Stop => {
                self.stop(instance).await?;
            }
            TaskAction::Restart => {
                self.restart(instance).await?;
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::store::config::test_instance;

    async fn setup(
        tune: impl FnOnce(&mut Settings),
    ) -> (tempfile::TempDir, Arc<ConfigStore>, InstanceSupervisor) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::open(dir.path()).await.unwrap());
        let mut settings = config.settings().await;
        tune(&mut settings);
        config.write_settings(settings).await.unwrap().unwrap();
        let sup = InstanceSupervisor::new(config.clone(), Arc::new(Broadcaster::new()));
        (dir, config, sup)
    }

    fn shell_instance(id: u32, base: &Path, script: &str) -> Instance {
        let mut inst = test_instance(id, base);
        inst.java = "none".to_string();
        inst.core = "/bin/sh".to_string();
        inst.args = vec!["-c".to_string(), script.to_string()];
        inst
    }

    const CONSOLE: &str = concat!(
        "echo ready; while read line; do ",
        r#"if [ "$line" = stop ]; then echo bye; exit 0; fi; "#,
        r#"echo "got $line"; done"#,
    );

    async fn wait_for(
        sup: &InstanceSupervisor,
        id: InstanceId,
        f: impl Fn(&InstanceStatus) -> bool,
    ) -> InstanceStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = sup.status(id);
            if f(&status) {
                return status;
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out: {status:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_line(sup: &InstanceSupervisor, id: InstanceId, line: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !sup.logs(id).iter().any(|l| l == line) {
            assert!(tokio::time::Instant::now() < deadline, "no line {line:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn stop_returns_exactly_the_process_output() {
        let (dir, config, sup) = setup(|_| {}).await;
        config
            .create_instance(shell_instance(1, dir.path(), "echo one; echo two; read l; echo bye"))
            .await
            .unwrap();
        let id = InstanceId(1);

        let status = sup.start(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Running);
        assert!(status.pid.is_some());
        wait_for_line(&sup, id, "two").await;

        let status = sup.stop(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Stopped);
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(sup.logs(id), vec!["one", "two", "bye"]);
    }

    #[tokio::test]
    async fn console_stop_command_ends_in_stopped_without_restart() {
        let (dir, config, sup) = setup(|_| {}).await;
        config.create_instance(shell_instance(1, dir.path(), CONSOLE)).await.unwrap();
        let id = InstanceId(1);

        sup.start(id).await.unwrap();
        wait_for_line(&sup, id, "ready").await;
        sup.send_command(id, "list").await.unwrap();
        wait_for_line(&sup, id, "got list").await;
        sup.send_command(id, "stop").await.unwrap();

        let status = wait_for(&sup, id, |s| s.state == InstanceState::Stopped).await;
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(status.restart_attempts, 0);
        assert_eq!(sup.logs(id).last().map(String::as_str), Some("bye"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_spawn_one_process() {
        let (dir, config, sup) = setup(|_| {}).await;
        config.create_instance(shell_instance(1, dir.path(), CONSOLE)).await.unwrap();
        let id = InstanceId(1);

        let attempts = (0..8).map(|_| {
            let sup = sup.clone();
            tokio::spawn(async move { sup.start(id).await })
        });
        let results = futures_util::future::join_all(attempts).await;
        let ok = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(SupervisorError::AlreadyRunning(_)))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(busy, 7);

        sup.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn buffer_keeps_only_the_newest_lines() {
        let (dir, config, sup) = setup(|s| s.log_max_lines = 10).await;
        let script = "i=0; while [ $i -lt 15 ]; do echo l$i; i=$((i+1)); done; read l; echo bye";
        config.create_instance(shell_instance(1, dir.path(), script)).await.unwrap();
        let id = InstanceId(1);

        sup.start(id).await.unwrap();
        wait_for_line(&sup, id, "l14").await;
        sup.stop(id).await.unwrap();

        let expected: Vec<String> = (6..15).map(|i| format!("l{i}")).chain(["bye".to_string()]).collect();
        assert_eq!(sup.logs(id), expected);
    }

    #[tokio::test]
    async fn crash_loop_restarts_with_bounded_retries() {
        let (dir, config, sup) = setup(|s| {
            s.restart_max_retries = 2;
            s.restart_backoff_ms = 100;
            s.restart_backoff_max_ms = 200;
        })
        .await;
        let mut inst = shell_instance(1, dir.path(), "echo up; exit 3");
        inst.auto_restart = true;
        config.create_instance(inst).await.unwrap();
        let id = InstanceId(1);

        sup.start(id).await.unwrap();
        let status = wait_for(&sup, id, |s| {
            s.state == InstanceState::Stopped
                && s.message.as_deref().is_some_and(|m| m.contains("gave up"))
        })
        .await;
        assert_eq!(status.exit_code, Some(3));
        assert_eq!(status.restart_attempts, 2);
        assert_eq!(sup.logs(id).iter().filter(|l| *l == "up").count(), 3);
    }

    #[tokio::test]
    async fn stop_while_restarting_cancels_the_pending_restart() {
        let (dir, config, sup) = setup(|s| {
            s.restart_backoff_ms = 500;
            s.restart_backoff_max_ms = 500;
        })
        .await;
        let mut inst = shell_instance(1, dir.path(), "echo up; exit 3");
        inst.auto_restart = true;
        config.create_instance(inst).await.unwrap();
        let id = InstanceId(1);

        sup.start(id).await.unwrap();
        wait_for(&sup, id, |s| s.state == InstanceState::Restarting).await;
        let status = sup.stop(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Stopped);
        assert_eq!(status.message.as_deref(), Some("restart cancelled"));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(sup.state(id), InstanceState::Stopped);
        assert_eq!(sup.logs(id).iter().filter(|l| *l == "up").count(), 1);
    }

    #[tokio::test]
    async fn clean_exits_restart_only_when_forced() {
        let (dir, config, sup) = setup(|s| {
            s.restart_max_retries = 1;
            s.restart_backoff_ms = 100;
            s.restart_backoff_max_ms = 100;
        })
        .await;
        let mut forced = shell_instance(1, dir.path(), "echo up; exit 0");
        forced.force_auto_restart = true;
        config.create_instance(forced).await.unwrap();
        let mut plain = shell_instance(2, dir.path(), "echo up; exit 0");
        plain.auto_restart = true;
        config.create_instance(plain).await.unwrap();

        sup.start(InstanceId(1)).await.unwrap();
        let status = wait_for(&sup, InstanceId(1), |s| {
            s.state == InstanceState::Stopped
                && s.message.as_deref().is_some_and(|m| m.contains("gave up"))
        })
        .await;
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(status.restart_attempts, 1);
        assert_eq!(sup.logs(InstanceId(1)).iter().filter(|l| *l == "up").count(), 2);

        sup.start(InstanceId(2)).await.unwrap();
        let status = wait_for(&sup, InstanceId(2), |s| s.state == InstanceState::Stopped).await;
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(status.restart_attempts, 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sup.state(InstanceId(2)), InstanceState::Stopped);
        assert_eq!(sup.logs(InstanceId(2)).iter().filter(|l| *l == "up").count(), 1);
    }

    #[tokio::test]
    async fn remove_waits_for_the_lifecycle_lock() {
        let (dir, config, sup) = setup(|_| {}).await;
        config.create_instance(shell_instance(1, dir.path(), CONSOLE)).await.unwrap();
        let id = InstanceId(1);

        sup.start(id).await.unwrap();
        wait_for_line(&sup, id, "ready").await;
        assert!(matches!(sup.remove(id).await, Err(SupervisorError::AlreadyRunning(_))));

        let slot = sup.existing_slot(id).unwrap();
        let op = slot.op.lock().await;
        let removing = tokio::spawn({
            let sup = sup.clone();
            async move { sup.remove(id).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!removing.is_finished());

        let status = sup.stop_locked(&slot).await.unwrap();
        assert_eq!(status.state, InstanceState::Stopped);
        drop(op);

        removing.await.unwrap().unwrap();
        assert!(sup.existing_slot(id).is_none());
        assert!(sup.logs(id).is_empty());
    }

    #[tokio::test]
    async fn unresponsive_process_is_killed_after_timeout() {
        let (dir, config, sup) = setup(|s| s.stop_timeout_secs = 1).await;
        let script = "trap '' TERM; echo stubborn; while true; do sleep 1; done";
        config.create_instance(shell_instance(1, dir.path(), script)).await.unwrap();
        let id = InstanceId(1);

        sup.start(id).await.unwrap();
        wait_for_line(&sup, id, "stubborn").await;
        let status = sup.stop(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Stopped);
        assert_eq!(status.exit_code, None);
    }

    #[tokio::test]
    async fn operations_on_idle_instances_are_rejected() {
        let (dir, config, sup) = setup(|_| {}).await;
        config.create_instance(shell_instance(1, dir.path(), CONSOLE)).await.unwrap();

        assert!(matches!(
            sup.send_command(InstanceId(1), "list").await,
            Err(SupervisorError::NotRunning(_))
        ));
        assert!(matches!(sup.stop(InstanceId(1)).await, Err(SupervisorError::NotRunning(_))));
        assert!(matches!(sup.start(InstanceId(9)).await, Err(SupervisorError::NotFound(_))));
        assert_eq!(sup.state(InstanceId(1)), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn missing_base_path_fails_start() {
        let (dir, config, sup) = setup(|_| {}).await;
        config
            .create_instance(shell_instance(1, &dir.path().join("absent"), CONSOLE))
            .await
            .unwrap();

        let err = sup.start(InstanceId(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(..)));
        assert_eq!(sup.state(InstanceId(1)), InstanceState::Stopped);
    }
}
