//! A supervised core process
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! An exit the supervisor did not ask for moves straight from `Running` to
//! `Stopped`; telling that apart from a manual stop is the caller's job.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::common::{Error, Result};
use crate::core::CoreConfig;
use crate::model::CoreType;

use super::config_file::{write_atomic, write_config};
use super::log_filter::LogFilter;
use super::version::UNKNOWN;
use super::{describe_exit, ProcessSpec};

/// Grace period after the terminate signal
const GRACEFUL_STOP: Duration = Duration::from_secs(5);

/// Settle time after a force kill
const FORCE_STOP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
        }
    }
}

/// One core binary run with a fixed config model
pub struct Process<C: CoreConfig> {
    spec: ProcessSpec,
    /// Replaced wholesale on live edits, never mutated in place
    config: RwLock<Arc<C>>,
    config_path: Mutex<Option<PathBuf>>,
    state: Arc<watch::Sender<ProcessState>>,
    lifecycle: tokio::sync::Mutex<()>,
    /// Dropping the sender kills the child
    kill: Mutex<Option<oneshot::Sender<()>>>,
    pid: Mutex<Option<u32>>,
    started_at: Mutex<Option<Instant>>,
    version: RwLock<String>,
    api_port: AtomicU16,
    log: Arc<LogFilter>,
    exit_error: Arc<Mutex<Option<String>>>,
    online_clients: RwLock<Vec<String>>,
}

impl<C: CoreConfig> Process<C> {
    pub fn new(spec: ProcessSpec, config: C) -> Self {
        let (state, _) = watch::channel(ProcessState::Stopped);
        let api_port = config.api_port();
        Process {
            log: Arc::new(LogFilter::new(spec.core)),
            spec,
            config: RwLock::new(Arc::new(config)),
            config_path: Mutex::new(None),
            state: Arc::new(state),
            lifecycle: tokio::sync::Mutex::new(()),
            kill: Mutex::new(None),
            pid: Mutex::new(None),
            started_at: Mutex::new(None),
            version: RwLock::new(UNKNOWN.to_string()),
            api_port: AtomicU16::new(api_port),
            exit_error: Arc::new(Mutex::new(None)),
            online_clients: RwLock::new(Vec::new()),
        }
    }

    pub fn core(&self) -> CoreType {
        self.spec.core
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// True while the child exists and has not reported an exit.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), ProcessState::Running | ProcessState::Stopping)
    }

    /// The config model this process was started with
    pub fn config(&self) -> Arc<C> {
        self.config.read().clone()
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.config_path.lock().clone()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    pub fn version(&self) -> String {
        self.version.read().clone()
    }

    pub fn api_port(&self) -> u16 {
        self.api_port.load(Ordering::Relaxed)
    }

    /// Seconds since the child was spawned
    pub fn uptime(&self) -> u64 {
        self.started_at
            .lock()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn exit_error(&self) -> Option<String> {
        self.exit_error.lock().clone()
    }

    /// Last meaningful log line, or the exit error when nothing was logged.
    pub fn result(&self) -> String {
        let last = self.log.last_line();
        let result = if last.is_empty() {
            self.exit_error().unwrap_or_default()
        } else {
            last
        };
        if cfg!(windows) && result == "exit status 1" {
            return String::new();
        }
        result
    }

    pub fn online_clients(&self) -> Vec<String> {
        self.online_clients.read().clone()
    }

    pub fn set_online_clients(&self, clients: Vec<String>) {
        *self.online_clients.write() = clients;
    }

    /// Write the config, check it with the binary, then launch.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(Error::already_running(self.core().as_str()));
        }

        let result = self.launch().await;
        if let Err(e) = &result {
            error!("Failure in running {} process: {}", self.core(), e);
            *self.exit_error.lock() = Some(e.to_string());
            if self.state() == ProcessState::Starting {
                self.state.send_replace(ProcessState::Stopped);
            }
        }
        result
    }

    async fn launch(&self) -> Result<()> {
        let core = self.core();
        self.state.send_replace(ProcessState::Starting);

        if let Some(folder) = &self.spec.log_folder {
            if let Err(e) = tokio::fs::create_dir_all(folder).await {
                warn!("Failed to create log folder {}: {}", folder.display(), e);
            }
        }

        let data = self.config().to_pretty_json()?;
        let path =
            write_config(&self.spec.config_path, &self.spec.alternative_paths, &data).await?;
        *self.config_path.lock() = Some(path.clone());
        self.spec.check_file(&path).await?;

        let mut cmd = Command::new(&self.spec.binary);
        cmd.args(self.spec.run_args(&path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Starting {}: {} run -c {}", core, self.spec.binary.display(), path.display());
        let mut child = cmd.spawn().map_err(|e| {
            Error::process(
                core.as_str(),
                format!("failed to spawn {}: {}", self.spec.binary.display(), e),
            )
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, self.log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, self.log.clone()));
        }

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill.lock() = Some(kill_tx);
        *self.pid.lock() = pid;
        *self.started_at.lock() = Some(Instant::now());
        *self.exit_error.lock() = None;
        self.state.send_replace(ProcessState::Running);
        tokio::spawn(watch_child(
            core,
            child,
            kill_rx,
            self.state.clone(),
            self.exit_error.clone(),
        ));
        info!("{} started with PID: {}", core, pid.unwrap_or(0));

        let mut rx = self.state.subscribe();
        if wait_stopped(&mut rx, self.spec.startup_grace).await {
            return Err(Error::process(
                core.as_str(),
                format!("exited immediately after start: {}", self.result()),
            ));
        }

        *self.version.write() = self.spec.version().await;
        self.api_port.store(self.config().api_port(), Ordering::Relaxed);
        Ok(())
    }

    /// Terminate, wait 5s, force kill, wait 1s.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let core = self.core();
        if !self.is_running() {
            return Err(Error::not_running(core.as_str()));
        }

        let stopping = self.state.send_if_modified(|state| {
            if *state == ProcessState::Running {
                *state = ProcessState::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            return Ok(());
        }

        let mut rx = self.state.subscribe();
        self.terminate();
        if wait_stopped(&mut rx, GRACEFUL_STOP).await {
            info!("{} stopped", core);
            return Ok(());
        }

        warn!("{} didn't exit gracefully, forcing kill", core);
        self.force_kill();
        if wait_stopped(&mut rx, FORCE_STOP).await {
            return Ok(());
        }
        Err(Error::process(core.as_str(), "process did not exit after kill"))
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid() else {
            self.force_kill();
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
            self.force_kill();
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {
        self.force_kill();
    }

    fn force_kill(&self) {
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }
    }

    /// Apply a live edit to the config model. The edited model replaces the
    /// current one and is written back to the config file.
    pub async fn update_config(&self, edit: impl FnOnce(&mut C) -> bool) -> Result<bool> {
        let mut next = C::clone(&self.config());
        if !edit(&mut next) {
            return Ok(false);
        }
        let path = self.config_path();
        if let Some(path) = path {
            write_atomic(&path, &next.to_pretty_json()?).await?;
        }
        *self.config.write() = Arc::new(next);
        Ok(true)
    }
}

async fn wait_stopped(rx: &mut watch::Receiver<ProcessState>, limit: Duration) -> bool {
    let stopped = timeout(limit, rx.wait_for(|s| *s == ProcessState::Stopped)).await;
    matches!(stopped, Ok(Ok(_)))
}

async fn pump<R: AsyncRead + Unpin>(reader: R, log: Arc<LogFilter>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log.write(&line);
    }
}

async fn watch_child(
    core: CoreType,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    state: Arc<watch::Sender<ProcessState>>,
    exit_error: Arc<Mutex<Option<String>>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                debug!("Kill of {} failed: {}", core, e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) if status.success() => info!("{} exited", core),
        Ok(status) => {
            let text = describe_exit(status);
            if !(cfg!(windows) && text == "exit status 1") {
                warn!("{} exited: {}", core, text);
            }
            *exit_error.lock() = Some(text);
        }
        Err(e) => {
            error!("Failure in running {}: {}", core, e);
            *exit_error.lock() = Some(e.to_string());
        }
    }
    state.send_replace(ProcessState::Stopped);
}
