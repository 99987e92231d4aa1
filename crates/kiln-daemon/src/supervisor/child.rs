use std::{
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use encoding_rs::Encoding;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{Mutex, Notify, watch},
};

use super::logs::LogSink;

/// Fully resolved command line for a supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl std::fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.exec)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        write!(f, " (cwd {})", self.cwd.display())
    }
}

pub fn resolve_encoding(label: &str) -> &'static Encoding {
    Encoding::for_label(label.trim().as_bytes()).unwrap_or(encoding_rs::UTF_8)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub success: bool,
    pub runtime: Duration,
    pub error: Option<String>,
}

/// Shared handle used to write to the child's stdin.
pub type StdinHandle = Arc<Mutex<Option<ChildStdin>>>;

/// Kill switch and exit notification of a running child. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ChildControl {
    pid: Option<u32>,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<ExitReport>>,
}

impl ChildControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Asks the child (and its process group on unix) to terminate.
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        self.kill.notify_one();
    }

    /// Kills the child and its process group.
    pub fn kill(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        self.kill.notify_one();
    }

    /// Waits for the exit report; `None` on timeout.
    pub async fn wait(&self, timeout: Duration) -> Option<ExitReport> {
        let mut rx = self.exit.clone();
        let res = tokio::time::timeout(timeout, rx.wait_for(|r| r.is_some())).await;
        match res {
            Ok(Ok(report)) => report.clone(),
            _ => None,
        }
    }

    pub async fn wait_forever(&self) -> Option<ExitReport> {
        let mut rx = self.exit.clone();
        rx.wait_for(|r| r.is_some()).await.ok().and_then(|r| r.clone())
    }
}

pub struct Spawned {
    pub stdin: StdinHandle,
    pub control: ChildControl,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the daemon dies, take the child down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Spawns `spec` with piped stdio. stdout/stderr are decoded with `encoding` line by line
/// and emitted to `sink` in production order per stream. The exit report is published only
/// after both streams are drained, so the final lines always precede it.
pub fn spawn_captured(
    spec: &LaunchSpec,
    encoding: &'static Encoding,
    sink: LogSink,
) -> anyhow::Result<Spawned> {
    let mut cmd = Command::new(&spec.exec);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {spec}"))?;
    let started = tokio::time::Instant::now();
    let pid = child.id();

    let stdin = Arc::new(Mutex::new(child.stdin.take()));
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(pump_lines(out, encoding, sink.clone())));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(pump_lines(err, encoding, sink.clone())));
    }

    let kill = Arc::new(Notify::new());
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn({
        let kill = kill.clone();
        async move {
            let res = tokio::select! {
                res = child.wait() => res,
                _ = kill.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            for r in readers {
                let _ = r.await;
            }

            let runtime = started.elapsed();
            let report = match res {
                Ok(status) => ExitReport {
                    code: status.code(),
                    success: status.success(),
                    runtime,
                    error: None,
                },
                Err(err) => ExitReport {
                    code: None,
                    success: false,
                    runtime,
                    error: Some(format!("wait failed: {err}")),
                },
            };
            let _ = exit_tx.send(Some(report));
        }
    });

    Ok(Spawned {
        stdin,
        control: ChildControl {
            pid,
            kill,
            exit: exit_rx,
        },
    })
}

async fn pump_lines<R>(stream: R, encoding: &'static Encoding, sink: LogSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => sink.emit(decode_line(encoding, &buf)),
            Err(err) => {
                tracing::debug!(%err, "output stream closed");
                break;
            }
        }
    }
}

pub(crate) fn decode_line(encoding: &'static Encoding, raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let (text, _) = encoding.decode_without_bom_handling(&raw[..end]);
    text.into_owned()
}

/// Writes one line to the child's stdin in `encoding`. `false` when stdin is gone.
pub async fn write_line(stdin: &StdinHandle, encoding: &'static Encoding, text: &str) -> bool {
    let mut guard = stdin.lock().await;
    let Some(pipe) = guard.as_mut() else {
        return false;
    };

    let line = text.trim_end_matches(['\r', '\n']);
    let (bytes, _, _) = encoding.encode(line);
    let res = async {
        pipe.write_all(&bytes).await?;
        pipe.write_all(b"\n").await?;
        pipe.flush().await
    }
    .await;

    if let Err(err) = res {
        tracing::debug!(%err, "stdin write failed");
        *guard = None;
        return false;
    }
    true
}
